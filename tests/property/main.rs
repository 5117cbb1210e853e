//! Property-based tests over the public scheduler API.
//!
//! Run with: `cargo test --test property`

mod scheduler_props;
