use std::io::BufRead;

use crate::error::Error;

const SIGNATURES: [&[u8]; 2] = [b"dRonin git hash:", b"Tau Labs git hash:"];
const MAX_HEADER_SCAN: usize = 100;

/// Text header written in front of recorded logs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogHeader {
    /// Revision of the object definitions the log was recorded with.
    pub githash: String,
    pub uavo_hash: String,
}

impl LogHeader {
    /// Consumes the header lines from `reader`, leaving it at the first byte
    /// of log data. Leading garbage of up to 100 lines is skipped.
    pub fn parse(reader: &mut impl BufRead) -> Result<Self, Error> {
        let mut line = Vec::new();
        let mut found = false;
        for _ in 0..MAX_HEADER_SCAN {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }
            let trimmed = line.strip_suffix(b"\n").unwrap_or(&line);
            let trimmed = trimmed.strip_suffix(b"\r").unwrap_or(trimmed);
            if SIGNATURES.iter().any(|sig| trimmed.ends_with(sig)) {
                found = true;
                break;
            }
        }
        if !found {
            return Err(Error::LogHeader("no header signature".to_string()));
        }

        let githash = read_line(reader)?;
        let githash = match githash.split_once(':') {
            Some((_, rest)) => rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect(),
            None => githash,
        };
        let uavo_hash = read_line(reader)?;
        Ok(LogHeader { githash, uavo_hash })
    }
}

fn read_line(reader: &mut impl BufRead) -> Result<String, Error> {
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line)? == 0 {
        return Err(Error::LogHeader("truncated header".to_string()));
    }
    // latin-1
    let line: String = line.iter().map(|b| *b as char).collect();
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
