//! Operator stand-in for instruments without a driver

use std::io::{self, BufRead, Write};

use tracing::info;

use super::Instrument;
use crate::{Error, Result};

/// Instrument whose settings are performed by the operator at the console.
///
/// `set_output` prints the requested setting and blocks until the operator
/// confirms with Enter; `read_input` asks the operator to type the reading.
pub struct ConsoleInstrument<R, W> {
    name: String,
    input: R,
    output: W,
}

impl ConsoleInstrument<io::BufReader<io::Stdin>, io::Stdout> {
    /// Stand-in on the process's stdin/stdout.
    #[must_use]
    pub fn stdio(name: impl Into<String>) -> Self {
        Self::new(name, io::BufReader::new(io::stdin()), io::stdout())
    }
}

impl<R: BufRead, W: Write> ConsoleInstrument<R, W> {
    /// Stand-in over an arbitrary reader/writer pair.
    pub fn new(name: impl Into<String>, input: R, output: W) -> Self {
        Self {
            name: name.into(),
            input,
            output,
        }
    }

    /// Consume the stand-in, returning the prompt writer.
    pub fn into_output(self) -> W {
        self.output
    }

    fn prompt(&mut self, message: &str) -> Result<String> {
        write!(self.output, "{message}")?;
        self.output.flush()?;
        let mut line = String::new();
        let read = self.input.read_line(&mut line)?;
        if read == 0 {
            return Err(Error::instrument(
                &self.name,
                "console closed while waiting for operator",
            ));
        }
        Ok(line.trim().to_string())
    }
}

impl<R: BufRead, W: Write> Instrument for ConsoleInstrument<R, W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn set_output(&mut self, channel: usize, value: f64) -> Result<()> {
        info!(instrument = %self.name, channel, value, "manual setting requested");
        let message = format!(
            "[{}] set channel {channel} to {value} manually, then press Enter: ",
            self.name
        );
        self.prompt(&message)?;
        Ok(())
    }

    fn read_input(&mut self, channel: usize) -> Result<f64> {
        let message = format!("[{}] enter reading of channel {channel}: ", self.name);
        let answer = self.prompt(&message)?;
        answer.parse::<f64>().map_err(|e| {
            Error::instrument(&self.name, format!("could not parse reading {answer:?}: {e}"))
        })
    }

    fn set_input_enabled(&mut self, enabled: bool) -> Result<()> {
        let state = if enabled { "ON" } else { "OFF" };
        let message = format!("[{}] switch input {state}, then press Enter: ", self.name);
        self.prompt(&message)?;
        Ok(())
    }
}
