//! Process bootstrap helpers shared by binaries and tests.

pub mod bootstrap;
