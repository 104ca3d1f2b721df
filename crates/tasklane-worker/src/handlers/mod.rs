//! Handlers for each queue's task enum.

mod ai;
mod emails;

pub use ai::AiHandlers;
pub use emails::EmailHandlers;
