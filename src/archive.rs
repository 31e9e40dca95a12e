//! Archive rewriting: run the copy pipeline over every member,
//! isolating member failures, and rebuild the archive.

use std::fs;

#[cfg(feature = "logging")]
use log::warn;
use object::read::archive::ArchiveFile;

use crate::config::Options;
use crate::copier::{Copier, CopyOutput};
use crate::{Error, Result};

/// Returns true if `data` looks like an archive.
pub(crate) fn is_archive(data: &[u8]) -> bool {
    data.starts_with(&object::archive::MAGIC) || data.starts_with(&object::archive::THIN_MAGIC)
}

/// Reject member paths that would escape the extraction directory.
fn validate_member_name(name: &[u8]) -> Result<()> {
    let illegal = name.starts_with(b"/")
        || name.starts_with(b"\\")
        || name.get(1) == Some(&b':')
        || name
            .split(|&byte| byte == b'/' || byte == b'\\')
            .any(|component| component == b"..");
    if illegal {
        return Err(Error::config(format!(
            "illegal pathname found in archive member: {}",
            String::from_utf8_lossy(name)
        )));
    }
    Ok(())
}

/// Copy every member of an archive, rebuilding the archive from the
/// per-member outputs.
///
/// Members are processed strictly in order. A member that fails to copy
/// is dropped from the output and marks the run as failed; a member that
/// is not a recognized object format is copied through as an opaque
/// blob, which also marks the run as failed. Temporary state lives in a
/// unique directory that is removed regardless of the outcome.
pub(crate) fn copy_archive(data: &[u8], options: &Options) -> Result<CopyOutput> {
    let archive = ArchiveFile::parse(data).map_err(Error::parse)?;
    let dir = tempfile::Builder::new()
        .prefix("object-copy")
        .tempdir()
        .map_err(Error::io)?;
    let mut builder = ar::Builder::new(Vec::new());
    let mut failed = false;

    for (index, member) in archive.members().enumerate() {
        let member = member.map_err(Error::parse)?;
        let name = member.name();
        validate_member_name(name)?;
        let member_data = member.data(data).map_err(Error::parse)?;

        let produced = match Copier::read(member_data) {
            Ok(copier) => match copier.copy(options) {
                Ok(output) => {
                    failed |= output.failed;
                    Some(output.data)
                }
                Err(_error) => {
                    #[cfg(feature = "logging")]
                    warn!(
                        "Failed to copy archive member {}: {}",
                        String::from_utf8_lossy(name),
                        _error
                    );
                    failed = true;
                    None
                }
            },
            Err(_) => {
                // Not an object; pass the bytes through untouched.
                #[cfg(feature = "logging")]
                warn!(
                    "Archive member {}: file format not recognized, copying verbatim",
                    String::from_utf8_lossy(name)
                );
                failed = true;
                Some(member_data.to_vec())
            }
        };
        let Some(bytes) = produced else {
            continue;
        };

        // Write the member output to the temporary directory and reopen
        // it read-only before splicing it into the new archive.
        let path = dir.path().join(format!("member.{}", index));
        fs::write(&path, &bytes).map_err(Error::io)?;
        let reread = fs::read(&path).map_err(Error::io)?;

        let mut header = ar::Header::new(name.to_vec(), reread.len() as u64);
        if let Some(date) = member.date() {
            header.set_mtime(date);
        }
        if let Some(uid) = member.uid() {
            header.set_uid(uid as u32);
        }
        if let Some(gid) = member.gid() {
            header.set_gid(gid as u32);
        }
        if let Some(mode) = member.mode() {
            header.set_mode(mode as u32);
        }
        builder
            .append(&header, reread.as_slice())
            .map_err(Error::io)?;
    }

    let data = builder.into_inner().map_err(Error::io)?;
    Ok(CopyOutput { data, failed })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_names_must_stay_relative() {
        assert!(validate_member_name(b"liba.o").is_ok());
        assert!(validate_member_name(b"dir/liba.o").is_ok());
        assert!(validate_member_name(b"/etc/passwd").is_err());
        assert!(validate_member_name(b"../liba.o").is_err());
        assert!(validate_member_name(b"dir/../../liba.o").is_err());
        assert!(validate_member_name(b"c:\\temp\\liba.o").is_err());
        let err = validate_member_name(b"..").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }
}
