//! yEnc article builders and NZB generators for E2E scenarios

/// CRC32-IEEE of a byte slice
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// yEnc-encode a payload with line wrapping and critical-character
/// escaping, the way a posting client would.
pub fn yenc_encode(data: &[u8], line_len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut col = 0;
    for &b in data {
        let enc = b.wrapping_add(42);
        if matches!(enc, 0x00 | 0x0A | 0x0D | b'=') {
            out.push(b'=');
            out.push(enc.wrapping_add(64));
            col += 2;
        } else {
            out.push(enc);
            col += 1;
        }
        if col >= line_len {
            out.extend_from_slice(b"\r\n");
            col = 0;
        }
    }
    if col > 0 {
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// A complete single-part article body with a valid `pcrc32`
pub fn single_part_article(name: &str, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(
        format!(
            "=ybegin part=1 line=128 size={} name={name}\r\n",
            data.len()
        )
        .as_bytes(),
    );
    out.extend_from_slice(&yenc_encode(data, 128));
    out.extend_from_slice(
        format!(
            "=yend size={} part=1 pcrc32={:08x}\r\n",
            data.len(),
            crc32(data)
        )
        .as_bytes(),
    );
    out
}

/// Like [`single_part_article`] but with a deliberately wrong checksum
pub fn corrupted_article(name: &str, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(
        format!(
            "=ybegin part=1 line=128 size={} name={name}\r\n",
            data.len()
        )
        .as_bytes(),
    );
    out.extend_from_slice(&yenc_encode(data, 128));
    out.extend_from_slice(
        format!(
            "=yend size={} part=1 pcrc32={:08x}\r\n",
            data.len(),
            !crc32(data)
        )
        .as_bytes(),
    );
    out
}

/// One part of a multi-part article: `=ypart` carries the 1-based
/// placement of this slice within the whole file.
pub fn multi_part_article(
    name: &str,
    part_number: u32,
    file_size: u64,
    offset: u64,
    data: &[u8],
) -> Vec<u8> {
    let begin = offset + 1;
    let end = offset + data.len() as u64;
    let mut out = Vec::new();
    out.extend_from_slice(
        format!("=ybegin part={part_number} line=128 size={file_size} name={name}\r\n").as_bytes(),
    );
    out.extend_from_slice(format!("=ypart begin={begin} end={end}\r\n").as_bytes());
    out.extend_from_slice(&yenc_encode(data, 128));
    out.extend_from_slice(
        format!(
            "=yend size={} part={part_number} pcrc32={:08x}\r\n",
            data.len(),
            crc32(data)
        )
        .as_bytes(),
    );
    out
}

/// Deterministic pseudo-random payload for content comparisons
pub fn payload(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u64).wrapping_mul(31).wrapping_add(seed as u64) as u8)
        .collect()
}

/// One file entry for [`build_nzb`]
pub struct NzbFileSpec {
    /// Filename placed in the quoted subject
    pub name: String,
    /// (ordinal, declared bytes, message-id)
    pub segments: Vec<(u32, u64, String)>,
}

/// Render an NZB document with the standard header and one `<file>`
/// element per entry
pub fn build_nzb(files: &[NzbFileSpec]) -> String {
    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <nzb xmlns=\"http://www.newzbin.com/DTD/2003/nzb\">\n",
    );
    for (i, file) in files.iter().enumerate() {
        xml.push_str(&format!(
            "  <file poster=\"poster@example.com\" date=\"1700000000\" \
             subject=\"[{}/{}] &quot;{}&quot; yEnc (1/{})\">\n",
            i + 1,
            files.len(),
            file.name,
            file.segments.len()
        ));
        xml.push_str("    <groups><group>alt.binaries.test</group></groups>\n");
        xml.push_str("    <segments>\n");
        for (number, bytes, message_id) in &file.segments {
            xml.push_str(&format!(
                "      <segment bytes=\"{bytes}\" number=\"{number}\">{message_id}</segment>\n"
            ));
        }
        xml.push_str("    </segments>\n  </file>\n");
    }
    xml.push_str("</nzb>\n");
    xml
}
