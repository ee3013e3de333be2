//! ✍️ Row → CSV bytes. One line per row, header first, RFC 4180 quoting
//! courtesy of the `csv` crate (commas, quotes, and the ancient art of escaping them).

use std::sync::Arc;

use crate::common::Row;

#[derive(Debug)]
pub(crate) struct RowEncoder {
    // -- None until the first row shows up in implicit mode
    header: Option<Arc<[String]>>,
    header_written: bool,
    // -- implicit rows with no columns at all, waiting for a row that has some
    deferred_empty: usize,
    delimiter: u8,
}

impl RowEncoder {
    pub(crate) fn new(columns: Option<Arc<[String]>>, delimiter: u8) -> Self {
        Self {
            header: columns,
            header_written: false,
            deferred_empty: 0,
            delimiter,
        }
    }

    /// 📋 Write the header now if it's already known. No-op in implicit mode.
    pub(crate) fn encode_header(&mut self, out: &mut Vec<u8>) -> csv::Result<()> {
        match self.header.clone() {
            Some(header) if !self.header_written => {
                self.write_line(out, header.iter().map(String::as_str))?;
                self.header_written = true;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// ✍️ Append one row. The first row with any columns fixes an implicit
    /// file's header; later rows are re-ordered to it (missing → empty, extras
    /// dropped). Column-less rows seen before that are held and written as
    /// all-empty lines right after the header.
    pub(crate) fn encode(&mut self, row: &Row, out: &mut Vec<u8>) -> csv::Result<()> {
        let header = match &self.header {
            Some(header) => Arc::clone(header),
            None if row.is_empty() => {
                self.deferred_empty += 1;
                return Ok(());
            }
            None => {
                let header: Arc<[String]> = row.columns().map(str::to_string).collect();
                self.header = Some(Arc::clone(&header));
                header
            }
        };
        self.encode_header(out)?;
        for _ in 0..std::mem::take(&mut self.deferred_empty) {
            self.write_line(out, header.iter().map(|_| ""))?;
        }

        if row.matches_header(&header) {
            self.write_line(out, row.values())
        } else {
            self.write_line(out, header.iter().map(|column| row.get(column).unwrap_or("")))
        }
    }

    fn write_line<'a>(
        &self,
        out: &mut Vec<u8>,
        fields: impl Iterator<Item = &'a str>,
    ) -> csv::Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(false)
            .buffer_capacity(1024)
            .from_writer(out);
        writer.write_record(fields)?;
        writer.flush()?;
        Ok(())
    }
}
