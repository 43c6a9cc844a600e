//! Reader for Panda3D multifile (`.mf`) archives.
//!
//! Layout: optional `#` comment lines, the `pmf\0\n\r` magic, a little-endian
//! version/scale/timestamp header, then a chain of subfile index entries. All
//! addresses are relative to the end of the comment prefix and counted in
//! units of the scale factor.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::ZlibDecoder;

use super::{Bundle, ExtractError};

const MAGIC: &[u8; 6] = b"pmf\0\n\r";
const SUPPORTED_MAJOR: i16 = 1;
const SUPPORTED_MINOR: i16 = 1;
const MAX_SUBFILES: usize = 1 << 20;

const SF_DELETED: u16 = 0x0001;
const SF_INDEX_INVALID: u16 = 0x0002;
const SF_DATA_INVALID: u16 = 0x0004;
const SF_COMPRESSED: u16 = 0x0008;
const SF_ENCRYPTED: u16 = 0x0010;
const SF_SIGNATURE: u16 = 0x0020;

#[derive(Debug, Clone)]
struct Subfile {
    name: String,
    data_start: u64,
    data_length: u64,
    uncompressed_length: u64,
    flags: u16,
}

pub struct MultifileReader<R> {
    reader: R,
    offset: u64,
    scale_factor: u64,
    timestamp: u32,
    subfiles: Vec<Subfile>,
}

impl MultifileReader<BufReader<File>> {
    /// Open a multifile on disk and read its index.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or its header or index is
    /// invalid.
    pub fn open(path: &Path) -> Result<Self, ExtractError> {
        let file = File::open(path)
            .map_err(|error| ExtractError::io("failed to open multifile", path, error))?;
        Self::from_reader(BufReader::new(file))
    }
}

fn read_array<const N: usize, R: Read>(reader: &mut R) -> Result<[u8; N], ExtractError> {
    let mut buffer = [0_u8; N];
    reader.read_exact(&mut buffer).map_err(|error| {
        if error.kind() == std::io::ErrorKind::UnexpectedEof {
            ExtractError::Malformed("unexpected end of file".to_string())
        } else {
            ExtractError::Malformed(error.to_string())
        }
    })?;
    Ok(buffer)
}

fn read_u16<R: Read>(reader: &mut R) -> Result<u16, ExtractError> {
    read_array::<2, _>(reader).map(u16::from_le_bytes)
}

fn read_i16<R: Read>(reader: &mut R) -> Result<i16, ExtractError> {
    read_array::<2, _>(reader).map(i16::from_le_bytes)
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, ExtractError> {
    read_array::<4, _>(reader).map(u32::from_le_bytes)
}

fn seek_error(error: std::io::Error) -> ExtractError {
    ExtractError::Malformed(format!("seek failed: {error}"))
}

impl<R: Read + Seek> MultifileReader<R> {
    /// # Errors
    /// Returns an error when the header or index is invalid.
    pub fn from_reader(mut reader: R) -> Result<Self, ExtractError> {
        let offset = skip_comment_prefix(&mut reader)?;

        if &read_array::<6, _>(&mut reader).map_err(|_| ExtractError::UnknownFormat)? != MAGIC {
            return Err(ExtractError::UnknownFormat);
        }

        let major = read_i16(&mut reader)?;
        let minor = read_i16(&mut reader)?;
        if major != SUPPORTED_MAJOR || !(0..=SUPPORTED_MINOR).contains(&minor) {
            return Err(ExtractError::UnsupportedVersion { major, minor });
        }

        let scale_factor = u64::from(read_u32(&mut reader)?);
        if scale_factor == 0 {
            return Err(ExtractError::Malformed("scale factor is zero".to_string()));
        }
        let timestamp = if minor >= 1 { read_u32(&mut reader)? } else { 0 };

        let header_end = reader.stream_position().map_err(seek_error)? - offset;
        let mut this = Self {
            reader,
            offset,
            scale_factor,
            timestamp,
            subfiles: Vec::new(),
        };
        this.read_index(header_end.div_ceil(scale_factor) * scale_factor, minor)?;
        Ok(this)
    }

    fn read_index(&mut self, first: u64, minor: i16) -> Result<(), ExtractError> {
        let mut position = first;
        loop {
            self.reader
                .seek(SeekFrom::Start(self.offset + position))
                .map_err(seek_error)?;
            let next = u64::from(read_u32(&mut self.reader)?) * self.scale_factor;
            if next == 0 {
                return Ok(());
            }
            if next <= position {
                return Err(ExtractError::Malformed(format!(
                    "index entry at {position} points backwards to {next}"
                )));
            }
            if self.subfiles.len() >= MAX_SUBFILES {
                return Err(ExtractError::Malformed("too many subfiles".to_string()));
            }

            let data_start = u64::from(read_u32(&mut self.reader)?) * self.scale_factor;
            let data_length = u64::from(read_u32(&mut self.reader)?);
            let flags = read_u16(&mut self.reader)?;
            let uncompressed_length = if flags & (SF_COMPRESSED | SF_ENCRYPTED) != 0 {
                u64::from(read_u32(&mut self.reader)?)
            } else {
                data_length
            };
            if minor >= 1 {
                let _timestamp = read_u32(&mut self.reader)?;
            }
            let name_length = usize::from(read_u16(&mut self.reader)?);
            let mut name = vec![0_u8; name_length];
            self.reader
                .read_exact(&mut name)
                .map_err(|_| ExtractError::Malformed("truncated subfile name".to_string()))?;
            for byte in &mut name {
                *byte ^= 0xff;
            }

            if flags & (SF_DELETED | SF_INDEX_INVALID | SF_SIGNATURE) == 0 {
                self.subfiles.push(Subfile {
                    name: String::from_utf8_lossy(&name).into_owned(),
                    data_start,
                    data_length,
                    uncompressed_length,
                    flags,
                });
            }
            position = next;
        }
    }

    /// Archive-wide modification time, seconds since the Unix epoch.
    #[must_use]
    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    /// Decompressed size of member `index`.
    #[must_use]
    pub fn member_size(&self, index: usize) -> Option<u64> {
        self.subfiles
            .get(index)
            .map(|subfile| subfile.uncompressed_length)
    }

    /// Copy member `index` into `out`, inflating it when it is compressed.
    ///
    /// # Errors
    /// Returns an error for encrypted or damaged members and on I/O failure.
    pub fn read_member<W: std::io::Write>(
        &mut self,
        index: usize,
        out: &mut W,
    ) -> Result<u64, ExtractError> {
        let subfile = self
            .subfiles
            .get(index)
            .cloned()
            .ok_or(ExtractError::NoSuchMember(index))?;
        if subfile.flags & SF_ENCRYPTED != 0 {
            return Err(ExtractError::Encrypted(subfile.name));
        }
        if subfile.flags & SF_DATA_INVALID != 0 {
            return Err(ExtractError::Malformed(format!(
                "member {} has invalid data",
                subfile.name
            )));
        }

        self.reader
            .seek(SeekFrom::Start(self.offset + subfile.data_start))
            .map_err(seek_error)?;
        let mut raw = (&mut self.reader).take(subfile.data_length);

        let copied = if subfile.flags & SF_COMPRESSED != 0 {
            std::io::copy(&mut ZlibDecoder::new(raw), out)
        } else {
            std::io::copy(&mut raw, out)
        }
        .map_err(|error| ExtractError::Malformed(format!("member {}: {error}", subfile.name)))?;

        if copied != subfile.uncompressed_length {
            return Err(ExtractError::Malformed(format!(
                "member {} is {copied} bytes, index says {}",
                subfile.name, subfile.uncompressed_length
            )));
        }
        Ok(copied)
    }
}

/// Skip leading `#` lines and return the offset of the magic.
fn skip_comment_prefix<R: Read + Seek>(reader: &mut R) -> Result<u64, ExtractError> {
    let mut byte = [0_u8; 1];
    let mut position = 0_u64;
    loop {
        if reader.read(&mut byte).map_err(seek_error)? == 0 || byte[0] != b'#' {
            reader
                .seek(SeekFrom::Start(position))
                .map_err(seek_error)?;
            return Ok(position);
        }
        position += 1;
        loop {
            if reader.read(&mut byte).map_err(seek_error)? == 0 {
                return Err(ExtractError::UnknownFormat);
            }
            position += 1;
            if byte[0] == b'\n' {
                break;
            }
        }
    }
}

impl<R: Read + Seek> Bundle for MultifileReader<R> {
    fn len(&self) -> usize {
        self.subfiles.len()
    }

    fn member_name(&self, index: usize) -> Option<&str> {
        self.subfiles.get(index).map(|subfile| subfile.name.as_str())
    }

    fn extract_to(&mut self, index: usize, dest: &Path) -> Result<(), ExtractError> {
        let mut out = File::create(dest)
            .map_err(|error| ExtractError::io("failed to create extracted file", dest, error))?;
        self.read_member(index, &mut out)?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::{Cursor, Write as _};

    use super::{
        Bundle, ExtractError, MAGIC, MultifileReader, SF_COMPRESSED, SF_DELETED, SF_ENCRYPTED,
    };

    pub(crate) struct Member<'a> {
        pub name: &'a str,
        pub content: &'a [u8],
        pub flags: u16,
    }

    impl<'a> Member<'a> {
        pub(crate) fn plain(name: &'a str, content: &'a [u8]) -> Self {
            Self {
                name,
                content,
                flags: 0,
            }
        }

        pub(crate) fn compressed(name: &'a str, content: &'a [u8]) -> Self {
            Self {
                name,
                content,
                flags: SF_COMPRESSED,
            }
        }
    }

    /// Build a version 1.1 multifile with scale factor 1.
    pub(crate) fn build_multifile(prefix: &str, members: &[Member<'_>]) -> Vec<u8> {
        const HEADER_LEN: usize = 6 + 2 + 2 + 4 + 4;

        let payloads: Vec<Vec<u8>> = members
            .iter()
            .map(|member| {
                if member.flags & SF_COMPRESSED != 0 {
                    let mut encoder = flate2::write::ZlibEncoder::new(
                        Vec::new(),
                        flate2::Compression::default(),
                    );
                    encoder.write_all(member.content).expect("member should compress");
                    encoder.finish().expect("compression should finish")
                } else {
                    member.content.to_vec()
                }
            })
            .collect();

        let entry_len = |member: &Member<'_>| {
            let extra = if member.flags & (SF_COMPRESSED | SF_ENCRYPTED) != 0 { 4 } else { 0 };
            4 + 4 + 4 + 2 + extra + 4 + 2 + member.name.len()
        };

        let mut entry_starts = Vec::new();
        let mut cursor = HEADER_LEN;
        for member in members {
            entry_starts.push(cursor);
            cursor += entry_len(member);
        }
        let terminator = cursor;
        let mut data_start = terminator + 4;

        let mut out = prefix.as_bytes().to_vec();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&1_i16.to_le_bytes());
        out.extend_from_slice(&1_i16.to_le_bytes());
        out.extend_from_slice(&1_u32.to_le_bytes());
        out.extend_from_slice(&1_700_000_000_u32.to_le_bytes());

        for (index, member) in members.iter().enumerate() {
            let next = entry_starts.get(index + 1).copied().unwrap_or(terminator);
            let payload = &payloads[index];
            out.extend_from_slice(&u32::try_from(next).expect("fits").to_le_bytes());
            out.extend_from_slice(&u32::try_from(data_start).expect("fits").to_le_bytes());
            out.extend_from_slice(&u32::try_from(payload.len()).expect("fits").to_le_bytes());
            out.extend_from_slice(&member.flags.to_le_bytes());
            if member.flags & (SF_COMPRESSED | SF_ENCRYPTED) != 0 {
                out.extend_from_slice(
                    &u32::try_from(member.content.len()).expect("fits").to_le_bytes(),
                );
            }
            out.extend_from_slice(&0_u32.to_le_bytes());
            out.extend_from_slice(&u16::try_from(member.name.len()).expect("fits").to_le_bytes());
            out.extend(member.name.bytes().map(|byte| byte ^ 0xff));
            data_start += payload.len();
        }
        out.extend_from_slice(&0_u32.to_le_bytes());
        for payload in &payloads {
            out.extend_from_slice(payload);
        }
        out
    }

    fn read_all(reader: &mut MultifileReader<Cursor<Vec<u8>>>, index: usize) -> Vec<u8> {
        let mut out = Vec::new();
        reader
            .read_member(index, &mut out)
            .expect("member should be readable");
        out
    }

    #[test]
    fn reads_names_and_contents() {
        let bytes = build_multifile(
            "",
            &[
                Member::plain("phase_1/gui/button.png", b"png-bytes"),
                Member::plain("libpandadx9.dll", b"dll-bytes"),
            ],
        );
        let mut reader =
            MultifileReader::from_reader(Cursor::new(bytes)).expect("multifile should parse");

        assert_eq!(reader.len(), 2);
        assert_eq!(reader.member_name(0), Some("phase_1/gui/button.png"));
        assert_eq!(reader.member_name(1), Some("libpandadx9.dll"));
        assert_eq!(reader.timestamp(), 1_700_000_000);
        assert_eq!(read_all(&mut reader, 1), b"dll-bytes");
    }

    #[test]
    fn skips_comment_prefix_lines() {
        let bytes = build_multifile(
            "#! /usr/bin/env packp3d\n# second line\n",
            &[Member::plain("a.txt", b"alpha")],
        );
        let mut reader =
            MultifileReader::from_reader(Cursor::new(bytes)).expect("multifile should parse");

        assert_eq!(reader.member_name(0), Some("a.txt"));
        assert_eq!(read_all(&mut reader, 0), b"alpha");
    }

    #[test]
    fn inflates_compressed_members() {
        let content = b"compressible ".repeat(64);
        let bytes = build_multifile(
            "",
            &[Member {
                name: "phase_2/maps/big.rgb",
                content: &content,
                flags: SF_COMPRESSED,
            }],
        );
        let mut reader =
            MultifileReader::from_reader(Cursor::new(bytes)).expect("multifile should parse");

        assert_eq!(reader.member_size(0), Some(content.len() as u64));
        assert_eq!(read_all(&mut reader, 0), content);
    }

    #[test]
    fn hides_deleted_members() {
        let bytes = build_multifile(
            "",
            &[
                Member {
                    name: "old.txt",
                    content: b"old",
                    flags: SF_DELETED,
                },
                Member::plain("new.txt", b"new"),
            ],
        );
        let mut reader =
            MultifileReader::from_reader(Cursor::new(bytes)).expect("multifile should parse");

        assert_eq!(reader.len(), 1);
        assert_eq!(reader.member_name(0), Some("new.txt"));
        assert_eq!(read_all(&mut reader, 0), b"new");
    }

    #[test]
    fn encrypted_members_are_rejected() {
        let bytes = build_multifile(
            "",
            &[Member {
                name: "secret.bin",
                content: b"cipher",
                flags: SF_ENCRYPTED,
            }],
        );
        let mut reader =
            MultifileReader::from_reader(Cursor::new(bytes)).expect("multifile should parse");

        let mut out = Vec::new();
        assert!(matches!(
            reader.read_member(0, &mut out),
            Err(ExtractError::Encrypted(ref name)) if name == "secret.bin"
        ));
    }

    #[test]
    fn rejects_wrong_magic_and_version() {
        assert!(matches!(
            MultifileReader::from_reader(Cursor::new(b"PMF\0\n\r".to_vec())),
            Err(ExtractError::UnknownFormat)
        ));

        let mut bytes = build_multifile("", &[]);
        bytes[6..8].copy_from_slice(&2_i16.to_le_bytes());
        assert!(matches!(
            MultifileReader::from_reader(Cursor::new(bytes)),
            Err(ExtractError::UnsupportedVersion { major: 2, .. })
        ));
    }

    #[test]
    fn truncated_index_is_malformed() {
        let mut bytes = build_multifile("", &[Member::plain("a.txt", b"alpha")]);
        bytes.truncate(24);
        assert!(matches!(
            MultifileReader::from_reader(Cursor::new(bytes)),
            Err(ExtractError::Malformed(_))
        ));
    }
}
