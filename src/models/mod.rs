pub mod performance;
pub mod proxy;
pub mod site;
pub mod source;

pub use performance::*;
pub use proxy::*;
pub use site::*;
pub use source::*;
