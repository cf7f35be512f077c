// Scenario tests for the update pipeline, driven through in-memory
// platform doubles.

pub mod support;

#[cfg(test)]
mod modem_flow_tests;
