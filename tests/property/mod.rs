//! Property-based tests for classification rules

mod health_classification;
