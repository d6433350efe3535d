// src/changeset/file.rs

//! Changeset container stream
//!
//! A changeset file is a header line followed by records, each introduced
//! by a keyword line:
//!
//! ```text
//! CONARY-CHANGESET 1
//! TROVE <lines>                            followed by a frozen trove changeset
//! REMOVED <name> <version> <flavor|->
//! FILE <fileId> <version> <sha1> <0|1>
//! CONTENTS <fileId> file <0|1> <len>       followed by len bytes and a newline
//! CONTENTS <fileId> ptr <targetFileId>
//! ```

use super::{ChangeSet, FileContents, FileInfo, TroveChangeSet};
use crate::error::{Error, Result};
use crate::flavor::Flavor;
use crate::hash::FileId;
use crate::trove::TroveKey;
use crate::version::Version;
use std::io::{BufRead, Read, Write};
use std::path::Path;
use tracing::debug;

const MAGIC: &str = "CONARY-CHANGESET 1";

impl ChangeSet {
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writeln!(writer, "{}", MAGIC)?;

        for cs in &self.new_troves {
            let frozen = cs.freeze();
            writeln!(writer, "TROVE {}", frozen.lines().count())?;
            writer.write_all(frozen.as_bytes())?;
        }

        for key in &self.old_troves {
            let flavor = key.flavor.freeze();
            writeln!(
                writer,
                "REMOVED {} {} {}",
                key.name,
                key.version.freeze(),
                if flavor.is_empty() { "-" } else { flavor.as_str() }
            )?;
        }

        for (file_id, info) in &self.files {
            writeln!(
                writer,
                "FILE {} {} {} {}",
                file_id,
                info.version.freeze(),
                info.sha1,
                u8::from(info.config)
            )?;
        }

        for (file_id, contents) in &self.contents {
            match contents {
                FileContents::Full { data, compressed } => {
                    writeln!(
                        writer,
                        "CONTENTS {} file {} {}",
                        file_id,
                        u8::from(*compressed),
                        data.len()
                    )?;
                    writer.write_all(data)?;
                    writer.write_all(b"\n")?;
                }
                FileContents::Pointer(target) => {
                    writeln!(writer, "CONTENTS {} ptr {}", file_id, target)?;
                }
            }
        }

        writer.flush()?;
        Ok(())
    }

    pub fn read_from<R: BufRead>(reader: &mut R) -> Result<Self> {
        let header = read_line(reader)?
            .ok_or_else(|| Error::ParseError("empty changeset stream".to_string()))?;
        if header != MAGIC {
            return Err(Error::ParseError(format!(
                "not a changeset stream (header '{}')",
                header
            )));
        }

        let mut changeset = ChangeSet::new();
        while let Some(line) = read_line(reader)? {
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split(' ').collect();
            match fields.as_slice() {
                ["TROVE", count] => {
                    let count: usize = count.parse().map_err(|_| bad_record(&line))?;
                    let mut lines = Vec::new();
                    for _ in 0..count {
                        lines.push(read_line(reader)?.ok_or_else(|| {
                            Error::ParseError("changeset stream ends inside a trove".to_string())
                        })?);
                    }
                    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
                    changeset.new_trove(TroveChangeSet::thaw_lines(&refs)?);
                }
                ["REMOVED", name, version, flavor] => {
                    let flavor = match *flavor {
                        "-" => Flavor::new(),
                        f => Flavor::thaw(f)?,
                    };
                    changeset.old_trove(TroveKey::new(name, Version::thaw(version)?, flavor));
                }
                ["FILE", file_id, version, sha1, config] => {
                    let config = match *config {
                        "0" => false,
                        "1" => true,
                        _ => return Err(bad_record(&line)),
                    };
                    changeset.add_file(
                        file_id.parse()?,
                        FileInfo {
                            version: Version::thaw(version)?,
                            sha1: sha1.parse()?,
                            config,
                        },
                    )?;
                }
                ["CONTENTS", file_id, "file", compressed, len] => {
                    let compressed = match *compressed {
                        "0" => false,
                        "1" => true,
                        _ => return Err(bad_record(&line)),
                    };
                    let len: usize = len.parse().map_err(|_| bad_record(&line))?;
                    let mut data = Vec::new();
                    reader.by_ref().take(len as u64).read_to_end(&mut data)?;
                    if data.len() != len {
                        return Err(Error::ParseError(format!(
                            "changeset stream ends inside the contents of {}",
                            file_id
                        )));
                    }
                    let mut newline = [0u8; 1];
                    reader.read_exact(&mut newline)?;
                    if newline[0] != b'\n' {
                        return Err(Error::ParseError(format!(
                            "contents of {} overrun their length",
                            file_id
                        )));
                    }
                    changeset
                        .add_file_contents(file_id.parse()?, FileContents::Full { data, compressed });
                }
                ["CONTENTS", file_id, "ptr", target] => {
                    changeset.add_file_contents(
                        file_id.parse()?,
                        FileContents::Pointer(target.parse::<FileId>()?),
                    );
                }
                _ => return Err(bad_record(&line)),
            }
        }

        debug!(
            "Read changeset: {} troves, {} removals, {} files",
            changeset.new_troves.len(),
            changeset.old_troves.len(),
            changeset.files.len()
        );
        Ok(changeset)
    }

    pub fn write_file(&self, path: &Path) -> Result<()> {
        let mut file = std::io::BufWriter::new(std::fs::File::create(path)?);
        self.write_to(&mut file)
    }

    pub fn read_file(path: &Path) -> Result<Self> {
        let mut file = std::io::BufReader::new(std::fs::File::open(path)?);
        Self::read_from(&mut file)
    }
}

fn bad_record(line: &str) -> Error {
    Error::ParseError(format!("invalid changeset record '{}'", line))
}

/// One line without its terminator; `None` at end of stream
fn read_line<R: BufRead>(reader: &mut R) -> Result<Option<String>> {
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    if line.ends_with('\n') {
        line.pop();
    }
    Ok(Some(line))
}
