mod support;

mod peer_pool_tests;
mod progress_tests;
mod report_tests;
mod selector_tests;
mod service_tests;
mod state_nodes_tests;
