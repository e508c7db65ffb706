pub mod performance;
pub mod proxy;
pub mod site;
pub mod source;

pub use performance::PerformanceRepository;
pub use proxy::ProxyRepository;
pub use site::SiteRepository;
pub use source::{NewSource, SourceRepository};
