mod commands;
mod parser;
mod protocol;

pub use commands::{CommandFactory, MiCommand, MiInfo};
pub use parser::{escape_c_string, parse_line};
pub use protocol::{backend_message, MiProtocol};

#[cfg(test)]
#[ctor::ctor]
fn init_logger() {
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    }
}
