use std::error::Error;
use std::fmt;

/// Render an error and its source chain on a single line.
///
/// `{:#}`-style multi-line error output is too noisy for high-volume
/// log statements; `err.fmt_compact()` prints `outer: middle: root`.
pub struct CompactFmt<'e, E>(&'e E);

impl<E> fmt::Display for CompactFmt<'_, E>
where
    E: Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)?;

        let mut source = self.0.source();
        while let Some(err) = source {
            write!(f, ": {err}")?;
            source = err.source();
        }
        Ok(())
    }
}

pub trait FmtCompact {
    fn fmt_compact(&self) -> CompactFmt<'_, Self>
    where
        Self: Sized;
}

impl<E> FmtCompact for E
where
    E: Error,
{
    fn fmt_compact(&self) -> CompactFmt<'_, Self> {
        CompactFmt(self)
    }
}
