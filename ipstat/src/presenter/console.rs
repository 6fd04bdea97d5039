use std::io::{self, Write};

use color_eyre::eyre::{Result, WrapErr};

use super::Presenter;
use crate::snapshot::RankedSnapshot;

const HEADER: &str = "--- Traffic Stats ---";
const FOOTER: &str = "---------------------";
const EMPTY: &str = "No traffic captured yet.";

pub(crate) struct ConsolePresenter<W: Write> {
    out: W,
}

impl ConsolePresenter<io::Stdout> {
    pub(crate) fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> ConsolePresenter<W> {
    pub(crate) fn new(out: W) -> Self {
        Self { out }
    }
}

impl<W: Write> Presenter for ConsolePresenter<W> {
    fn present(&mut self, snapshot: &RankedSnapshot) -> Result<()> {
        // Render into memory first so a failed write never leaves half a table.
        let mut block = Vec::new();
        render(snapshot, &mut block)?;
        self.out
            .write_all(&block)
            .and_then(|()| self.out.flush())
            .wrap_err("failed to write traffic stats")
    }
}

pub(crate) fn render(snapshot: &RankedSnapshot, out: &mut impl Write) -> io::Result<()> {
    writeln!(out)?;
    writeln!(out, "{HEADER}")?;
    if snapshot.is_empty() {
        writeln!(out, "  {EMPTY}")?;
    }
    for entry in snapshot.entries() {
        writeln!(out, "  {:<15} : {} bytes", entry.address.to_string(), entry.bytes)?;
    }
    writeln!(out, "{FOOTER}")
}
