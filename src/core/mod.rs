//! Process-wide state shared across the server threads.

mod state;

pub use state::{
    EXIT_FAILURE, EXIT_RESTART, exit_code, is_shutdown, register_server, request_shutdown,
    setup_shutdown_handler,
};
