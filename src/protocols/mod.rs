//! Payload formats carried over the notification channel.
//!
//! - `bundle`: settings bundle literal codec

pub mod bundle;
