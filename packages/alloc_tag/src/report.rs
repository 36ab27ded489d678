use std::fmt;

use crate::{CountersSnapshot, TagCursor, TagRef};

/// Header printed in front of the first record of a listing.
pub const ALLOCINFO_HEADER: &str = "allocinfo - version: 1.0\n#     <size>  <calls> <tag info>\n";

/// Reader over the allocation report, one record per tag.
///
/// Holds the tag category read lock until dropped, so components cannot be loaded or
/// unloaded while a report is being produced.
///
/// # Example
///
/// ```
/// use alloc_tag::{AllocProfiler, Config, alloc_tag};
///
/// let profiler = AllocProfiler::new(&Config::default());
/// let tag = alloc_tag!("read_file");
/// profiler.register_builtin([tag]);
/// tag.counters().add(1, 4096);
///
/// let mut report = String::new();
/// profiler.allocinfo(0).write_to(&mut report).unwrap();
///
/// assert!(report.starts_with("allocinfo - version: 1.0\n"));
/// assert!(report.contains("        4096        1 "));
/// assert!(report.ends_with(" func:read_file \n"));
/// ```
#[derive(Debug)]
pub struct AllocInfo<'a> {
    cursor: TagCursor<'a>,
    print_header: bool,
}

impl<'a> AllocInfo<'a> {
    /// Positions the reader at record `position`. The header is only produced when
    /// starting from the first record.
    pub(crate) fn new(mut cursor: TagCursor<'a>, position: usize) -> Self {
        cursor.seek(position);

        Self {
            cursor,
            print_header: position == 0,
        }
    }

    /// Returns the header if it has not been produced yet, and marks it as produced.
    ///
    /// [`write_to()`][1] handles the header automatically.
    ///
    /// [1]: Self::write_to
    pub fn take_header(&mut self) -> Option<&'static str> {
        if self.print_header {
            self.print_header = false;
            Some(ALLOCINFO_HEADER)
        } else {
            None
        }
    }

    /// Writes the remaining records, one per line, preceded by the header if it has not
    /// been produced yet and there is at least one record.
    ///
    /// # Errors
    ///
    /// Returns an error if the writer fails.
    pub fn write_to<W>(self, out: &mut W) -> fmt::Result
    where
        W: fmt::Write,
    {
        let Self {
            cursor,
            mut print_header,
        } = self;

        for record in cursor.map(AllocInfoRecord::new) {
            if print_header {
                out.write_str(ALLOCINFO_HEADER)?;
                print_header = false;
            }

            writeln!(out, "{record}")?;
        }

        Ok(())
    }
}

impl Iterator for AllocInfo<'_> {
    type Item = AllocInfoRecord;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next().map(AllocInfoRecord::new)
    }
}

/// One line of the allocation report: the counters of a tag when it was read.
#[derive(Clone, Debug)]
pub struct AllocInfoRecord {
    tag: TagRef,
    counters: CountersSnapshot,
}

impl AllocInfoRecord {
    fn new(tag: TagRef) -> Self {
        let counters = tag.read();
        Self { tag, counters }
    }

    /// The tag the record describes.
    #[must_use]
    pub fn tag(&self) -> &TagRef {
        &self.tag
    }

    /// Live bytes of the tag when the record was read.
    #[must_use]
    pub fn bytes(&self) -> i64 {
        self.counters.bytes()
    }

    /// Calls accounted to the tag when the record was read.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.counters.calls()
    }
}

impl fmt::Display for AllocInfoRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>12} {:>8} {} ",
            self.counters.bytes(),
            self.counters.calls(),
            self.tag.code()
        )
    }
}
