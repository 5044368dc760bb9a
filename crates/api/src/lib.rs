//! HTTP ingress for the briefly summarization queue.

pub mod app;
