//! Tar archives of events, for bulk submission.

use std::io::Read;

use bytes::Bytes;
use tar::{Archive, Builder, Header};

use crate::types::VtpError;

/// Pack `payloads` into a tar archive, one member per payload, in order.
pub fn pack<B: AsRef<[u8]>>(payloads: &[B]) -> Result<Bytes, VtpError> {
    let mut builder = Builder::new(Vec::new());
    for (idx, payload) in payloads.iter().enumerate() {
        let payload = payload.as_ref();
        let mut header = Header::new_gnu();
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, format!("event-{idx:05}.xml"), payload)?;
    }
    Ok(Bytes::from(builder.into_inner()?))
}

/// Regular-file members of a tar archive, in archive order.
pub fn unpack(archive: &[u8]) -> Result<Vec<Bytes>, VtpError> {
    let mut archive = Archive::new(archive);
    let mut members = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let mut buf = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
        entry.read_to_end(&mut buf)?;
        members.push(Bytes::from(buf));
    }
    Ok(members)
}
