//! Command text assembly with argument bookkeeping.
//!
//! A [`SqlWriter`] accumulates SQL text and the values bound to its `?`
//! placeholders in a single pass: a placeholder can only be appended together
//! with its argument, so the rendered text and the argument list cannot
//! drift out of order.

use crate::value::SqlValue;

/// An ordered accumulator of SQL fragments and bound arguments.
#[derive(Debug, Clone, Default)]
pub struct SqlWriter {
    text: String,
    args: Vec<SqlValue>,
}

impl SqlWriter {
    /// Creates an empty writer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a raw SQL fragment.
    ///
    /// The fragment must not contain `?`; placeholders are emitted by
    /// [`SqlWriter::bind`] so that every `?` has a paired argument.
    pub fn push(&mut self, fragment: &str) {
        debug_assert!(
            !fragment.contains('?'),
            "placeholders must be emitted via bind()"
        );
        self.text.push_str(fragment);
    }

    /// Appends a `?` placeholder together with its argument.
    pub fn bind(&mut self, value: SqlValue) {
        self.text.push('?');
        self.args.push(value);
    }

    /// Appends a comma-separated placeholder list, one per value.
    pub fn bind_list(&mut self, values: impl IntoIterator<Item = SqlValue>) {
        for (i, value) in values.into_iter().enumerate() {
            if i > 0 {
                self.text.push_str(", ");
            }
            self.bind(value);
        }
    }

    /// Returns the number of arguments bound so far.
    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Returns the text rendered so far.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Consumes the writer, returning the final text and argument list.
    #[must_use]
    pub fn finish(self) -> (String, Vec<SqlValue>) {
        (self.text, self.args)
    }
}
