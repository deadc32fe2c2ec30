pub mod book;
pub mod order;
pub mod order_line;
pub mod payment;
pub mod shipping_method;

pub use order::OrderStatus;
pub use payment::{PaymentMethod, PaymentStatus};
