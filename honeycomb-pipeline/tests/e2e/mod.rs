//! End-to-end tests for the cache build and upload pipeline.

mod pipeline_test;
