pub mod driver;
pub mod echo;
pub mod factory;

pub use driver::{Driver, DriverRequest, DriverStream};
pub use echo::EchoDriver;
pub use factory::{create_driver, DriverConstructor, DriverRegistry};
