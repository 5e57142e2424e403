//! 能力路由：把请求分类到封闭的处理器类别

pub mod router;

pub use router::{CapabilityRouter, RouteDecision, RouterConfig};

use serde::{Deserialize, Serialize};

/// 处理器类别：封闭枚举，GeneralSupport 为指定默认项
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerCategory {
    PackageSearch,
    PackageDetail,
    BookingAssist,
    GeneralSupport,
}

impl HandlerCategory {
    pub const ALL: [HandlerCategory; 4] = [
        HandlerCategory::PackageSearch,
        HandlerCategory::PackageDetail,
        HandlerCategory::BookingAssist,
        HandlerCategory::GeneralSupport,
    ];

    /// 路由失败/低置信度时的兜底类别
    pub const DEFAULT: HandlerCategory = HandlerCategory::GeneralSupport;

    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerCategory::PackageSearch => "package_search",
            HandlerCategory::PackageDetail => "package_detail",
            HandlerCategory::BookingAssist => "booking_assist",
            HandlerCategory::GeneralSupport => "general_support",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "package_search" => Some(HandlerCategory::PackageSearch),
            "package_detail" => Some(HandlerCategory::PackageDetail),
            "booking_assist" => Some(HandlerCategory::BookingAssist),
            "general_support" => Some(HandlerCategory::GeneralSupport),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        for c in HandlerCategory::ALL {
            assert_eq!(HandlerCategory::parse(c.as_str()), Some(c));
        }
        assert_eq!(HandlerCategory::parse("unknown"), None);
    }
}
