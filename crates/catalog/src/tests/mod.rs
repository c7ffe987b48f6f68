mod descriptor_tests;
mod helpers;
mod recovery_tests;
