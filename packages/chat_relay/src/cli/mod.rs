pub mod chat;
pub mod users;

use anyhow::Result;

pub use chat::{Connection, cancel_command, chat_command, resume_command};
pub use users::add_user_command;

/// Print `prompt` to stderr and read one line from stdin.
pub(crate) async fn prompt_line(prompt: &str) -> Result<String> {
    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || -> Result<String> {
        use std::io::{self, BufRead, Write};

        eprint!("{prompt}");
        io::stderr().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    })
    .await?
}
