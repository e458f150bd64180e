pub mod jwt;
pub mod middleware;
pub mod reqid;
pub mod token;

pub use jwt::*;
pub use middleware::*;
pub use reqid::*;
pub use token::*;
