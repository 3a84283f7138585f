mod achievement;
mod currency;
mod donation;
mod payment;
mod project;
mod subscription;
mod tree_price;
mod user;
mod webhook_event;

pub use achievement::*;
pub use currency::*;
pub use donation::*;
pub use payment::*;
pub use project::*;
pub use subscription::*;
pub use tree_price::*;
pub use user::*;
pub use webhook_event::*;
