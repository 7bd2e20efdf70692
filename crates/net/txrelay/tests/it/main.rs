//! Integration tests driving the public API end to end.

mod reconciliation;
mod requests;

const fn main() {}
