mod helpers;
mod lifecycle_tests;
mod merge_tests;
