mod cloudpayments;

pub use cloudpayments::*;
