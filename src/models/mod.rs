mod activity;
mod order;
mod payment;
mod product;
mod subscription;

pub use activity::*;
pub use order::*;
pub use payment::*;
pub use product::*;
pub use subscription::*;
