//! 上游旅行数据服务边界

pub mod client;

pub use client::{PackageQuery, TravelApiClient, TravelApiConfig, TravelPackage};
