pub mod merge;
pub mod mime;
pub mod sendgrid;

pub use sendgrid::{OutboundEmail, SendGridClient, SendOutcome};
