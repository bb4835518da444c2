use std::fmt;

use miette::IntoDiagnostic;
use revmpi_proto::{CommandResult, OperationRecord, WorkerId};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin, Stdout};

/// Interactive terminal of the prompts.
pub(crate) struct Console {
    input: Lines<BufReader<Stdin>>,
    output: Stdout,
}

impl Console {
    pub(crate) fn new() -> Self {
        Self {
            input: BufReader::new(tokio::io::stdin()).lines(),
            output: tokio::io::stdout(),
        }
    }

    /// Shows `prompt` and reads the next non-empty line.
    ///
    /// Returns `None` once the input is closed.
    pub(crate) async fn read_line(&mut self, prompt: &str) -> miette::Result<Option<String>> {
        loop {
            self.output
                .write_all(prompt.as_bytes())
                .await
                .into_diagnostic()?;
            self.output.flush().await.into_diagnostic()?;

            let Some(line) = self.input.next_line().await.into_diagnostic()? else {
                return Ok(None);
            };

            let line = line.trim();

            if !line.is_empty() {
                return Ok(Some(line.to_owned()));
            }
        }
    }

    pub(crate) async fn print(&mut self, text: impl fmt::Display) -> miette::Result<()> {
        let text = format!("{text}\n");

        self.output
            .write_all(text.as_bytes())
            .await
            .into_diagnostic()?;
        self.output.flush().await.into_diagnostic()
    }

    /// Prints the outcome of a command, prefixing every line with the ID of
    /// the worker which ran it (if any).
    pub(crate) async fn print_result(
        &mut self,
        worker: Option<WorkerId>,
        result: &CommandResult,
    ) -> miette::Result<()> {
        let prefix = worker.map(|w| format!("[{w}] ")).unwrap_or_default();

        if let Some(output) = &result.output {
            for line in output.lines() {
                self.print(format_args!("{prefix}{line}")).await?;
            }
        }

        if let Some(error) = &result.error {
            self.print(format_args!("{prefix}error: {error}")).await?;
        }

        if result.exited {
            self.print(format_args!("{prefix}process exited")).await?;
        }

        Ok(())
    }

    pub(crate) async fn print_event(&mut self, record: &OperationRecord) -> miette::Result<()> {
        self.print(format_args!(
            "{} recorded at checkpoint {}",
            record.op_name, record.checkpoint_id
        ))
        .await
    }
}
