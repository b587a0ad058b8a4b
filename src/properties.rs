//! Property-based tests for the stream's core invariants.
//!
//! Queue-level properties run with full proptest case counts; properties that
//! spin up a whole stream use a reduced case count since each case spawns
//! threads.
