// Background jobs

pub mod auto_checkout;
