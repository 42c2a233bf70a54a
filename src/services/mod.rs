// Services module - Business logic

pub mod attendance;
pub mod clock;
pub mod day_window;
pub mod qr_checkin;
