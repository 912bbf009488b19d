//! Statement dump file format
//!
//! ```text
//! header   magic "\0rkBak" | version u16 | flags u16 | key_check [16]
//! section  size u32 | flags u32 | size bytes of deflate stream
//! ...
//! end      size 0 | flags 0
//! ```
//!
//! Integers are little endian. With a key, each section's stored bytes are
//! XOR'ed with the material keystream using the section index as nonce.
//! The inflated sections form one token stream:
//!
//! ```text
//! 0x81 SQL_ONESHOT   varint len, sql       run once, no binds
//! 0x82 SQL_REPEATED  varint len, sql       prepare; rows follow
//! 0x00..0x07 BIND_*                         one value of the current row
//! 0x80 LARGE_DATA    kind, varint len, data text or blob starting a section
//! 0x83 END_ROW                              execute the current row
//! 0x84 END_SQL                              drop the repeated statement
//! ```
//!
//! Varints are little-endian base-128. A negative integer is stored as its
//! bitwise complement under `BIND_VARINT_MINUS`.

use std::io::{self, Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use rusqlite::types::Value;

use crate::crypto::{Keystream, KEY_CHECK_LEN};

use super::errors::{BackupError, BackupResult};

pub const DUMP_MAGIC: &[u8; 6] = b"\0rkBak";
pub const DUMP_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 6 + 2 + 2 + KEY_CHECK_LEN;

const HEADER_FLAG_ENCRYPTED: u16 = 0x0001;

pub const BIND_NULL: u8 = 0x00;
pub const BIND_VARINT: u8 = 0x01;
pub const BIND_VARINT_MINUS: u8 = 0x02;
pub const BIND_FLOAT: u8 = 0x03;
pub const BIND_TEXT: u8 = 0x04;
pub const BIND_TEXT_SHORT: u8 = 0x05;
pub const BIND_BLOB: u8 = 0x06;
pub const BIND_BLOB_SHORT: u8 = 0x07;
pub const LARGE_DATA: u8 = 0x80;
pub const SQL_ONESHOT: u8 = 0x81;
pub const SQL_REPEATED: u8 = 0x82;
pub const END_ROW: u8 = 0x83;
pub const END_SQL: u8 = 0x84;

/// Inflated bytes buffered before a section is written.
const SECTION_TARGET: usize = 1 << 20;
/// Values at least this long start a section of their own.
const LARGE_VALUE: usize = 1 << 16;
/// Upper bound on one inflated section, against hostile size fields.
const MAX_SECTION: usize = 64 << 20;

/// One element of the token stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    OneShot(String),
    Repeated(String),
    Bind(Value),
    EndRow,
    EndSql,
}

pub fn write_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Parsed dump header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpHeader {
    pub encrypted: bool,
    pub key_check: [u8; KEY_CHECK_LEN],
}

impl DumpHeader {
    pub fn for_key(keystream: Option<&Keystream>) -> Self {
        Self {
            encrypted: keystream.is_some(),
            key_check: keystream.map(Keystream::key_check).unwrap_or([0; KEY_CHECK_LEN]),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..6].copy_from_slice(DUMP_MAGIC);
        out[6..8].copy_from_slice(&DUMP_VERSION.to_le_bytes());
        let flags = if self.encrypted { HEADER_FLAG_ENCRYPTED } else { 0 };
        out[8..10].copy_from_slice(&flags.to_le_bytes());
        out[10..].copy_from_slice(&self.key_check);
        out
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> BackupResult<Self> {
        if &raw[..6] != DUMP_MAGIC {
            return Err(BackupError::corrupt("not a statement dump"));
        }
        let version = u16::from_le_bytes([raw[6], raw[7]]);
        if version != DUMP_VERSION {
            return Err(BackupError::corrupt(format!("unsupported version {}", version)));
        }
        let flags = u16::from_le_bytes([raw[8], raw[9]]);
        if flags & !HEADER_FLAG_ENCRYPTED != 0 {
            return Err(BackupError::corrupt(format!("unknown header flags {:#x}", flags)));
        }
        let mut key_check = [0u8; KEY_CHECK_LEN];
        key_check.copy_from_slice(&raw[10..]);
        Ok(Self {
            encrypted: flags & HEADER_FLAG_ENCRYPTED != 0,
            key_check,
        })
    }

    /// Check `keystream` against the header.
    pub fn check_key(&self, keystream: Option<&Keystream>) -> BackupResult<()> {
        match (self.encrypted, keystream) {
            (false, _) => Ok(()),
            (true, None) => Err(BackupError::wrong_key("dump is encrypted and no key was given")),
            (true, Some(ks)) if ks.verify_key_check(&self.key_check) => Ok(()),
            (true, Some(_)) => Err(BackupError::wrong_key("key check mismatch")),
        }
    }
}

/// Buffers tokens and writes them out as compressed sections.
pub struct SectionWriter<W: Write> {
    out: W,
    keystream: Option<Keystream>,
    buffer: Vec<u8>,
    index: u64,
}

impl<W: Write> SectionWriter<W> {
    /// Write the header and return a writer positioned at the first section.
    pub fn new(mut out: W, keystream: Option<Keystream>) -> BackupResult<Self> {
        let header = DumpHeader::for_key(keystream.as_ref());
        out.write_all(&header.encode())
            .map_err(|e| BackupError::io("write dump header", e))?;
        Ok(Self {
            out,
            keystream,
            buffer: Vec::with_capacity(SECTION_TARGET),
            index: 0,
        })
    }

    pub fn write_token(&mut self, token: &Token) -> BackupResult<()> {
        match token {
            Token::OneShot(sql) => self.write_string(SQL_ONESHOT, sql.as_bytes()),
            Token::Repeated(sql) => self.write_string(SQL_REPEATED, sql.as_bytes()),
            Token::EndRow => self.buffer.push(END_ROW),
            Token::EndSql => self.buffer.push(END_SQL),
            Token::Bind(value) => self.write_value(value)?,
        }
        if self.buffer.len() >= SECTION_TARGET {
            self.flush_section()?;
        }
        Ok(())
    }

    fn write_string(&mut self, tag: u8, bytes: &[u8]) {
        self.buffer.push(tag);
        write_varint(bytes.len() as u64, &mut self.buffer);
        self.buffer.extend_from_slice(bytes);
    }

    fn write_value(&mut self, value: &Value) -> BackupResult<()> {
        let (long, short, bytes) = match value {
            Value::Null => {
                self.buffer.push(BIND_NULL);
                return Ok(());
            }
            Value::Integer(i) if *i >= 0 => {
                self.buffer.push(BIND_VARINT);
                write_varint(*i as u64, &mut self.buffer);
                return Ok(());
            }
            Value::Integer(i) => {
                self.buffer.push(BIND_VARINT_MINUS);
                write_varint(!*i as u64, &mut self.buffer);
                return Ok(());
            }
            Value::Real(f) => {
                self.buffer.push(BIND_FLOAT);
                self.buffer.extend_from_slice(&f.to_le_bytes());
                return Ok(());
            }
            Value::Text(s) => (BIND_TEXT, BIND_TEXT_SHORT, s.as_bytes()),
            Value::Blob(b) => (BIND_BLOB, BIND_BLOB_SHORT, b.as_slice()),
        };

        if bytes.len() >= LARGE_VALUE {
            if !self.buffer.is_empty() {
                self.flush_section()?;
            }
            self.buffer.push(LARGE_DATA);
            self.write_string(long, bytes);
            return self.flush_section();
        }
        if bytes.len() <= u8::MAX as usize {
            self.buffer.push(short);
            self.buffer.push(bytes.len() as u8);
            self.buffer.extend_from_slice(bytes);
        } else {
            self.write_string(long, bytes);
        }
        Ok(())
    }

    fn flush_section(&mut self) -> BackupResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&self.buffer)
            .map_err(|e| BackupError::io("compress section", e))?;
        let mut stored = encoder
            .finish()
            .map_err(|e| BackupError::io("compress section", e))?;
        if let Some(ref ks) = self.keystream {
            ks.apply(self.index, &mut stored);
        }
        let size = u32::try_from(stored.len())
            .map_err(|_| BackupError::corrupt("section larger than 4 GiB"))?;

        self.out
            .write_all(&size.to_le_bytes())
            .and_then(|_| self.out.write_all(&0u32.to_le_bytes()))
            .and_then(|_| self.out.write_all(&stored))
            .map_err(|e| BackupError::io("write section", e))?;
        self.buffer.clear();
        self.index += 1;
        Ok(())
    }

    /// Flush the last section, write the end marker and return the sink.
    pub fn finish(mut self) -> BackupResult<W> {
        self.flush_section()?;
        self.out
            .write_all(&[0u8; 8])
            .and_then(|_| self.out.flush())
            .map_err(|e| BackupError::io("finish dump", e))?;
        Ok(self.out)
    }
}

/// Reads sections back and yields tokens.
pub struct SectionReader<R: Read> {
    input: R,
    keystream: Option<Keystream>,
    current: Vec<u8>,
    pos: usize,
    index: u64,
    ended: bool,
}

impl<R: Read> SectionReader<R> {
    /// `input` must be positioned right after the header.
    pub fn new(input: R, keystream: Option<Keystream>) -> Self {
        Self {
            input,
            keystream,
            current: Vec::new(),
            pos: 0,
            index: 0,
            ended: false,
        }
    }

    /// Load the next section. Returns false at the end marker.
    fn next_section(&mut self) -> BackupResult<bool> {
        if self.ended {
            return Ok(false);
        }
        let mut head = [0u8; 8];
        read_exact_or_corrupt(&mut self.input, &mut head, "section header")?;
        let size = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
        let flags = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
        if flags != 0 {
            return Err(BackupError::corrupt(format!("unknown section flags {:#x}", flags)));
        }
        if size == 0 {
            self.ended = true;
            return Ok(false);
        }
        if size > MAX_SECTION {
            return Err(BackupError::corrupt(format!("section of {} bytes", size)));
        }

        let mut stored = vec![0u8; size];
        read_exact_or_corrupt(&mut self.input, &mut stored, "section body")?;
        if let Some(ref ks) = self.keystream {
            ks.apply(self.index, &mut stored);
        }
        let mut inflated = Vec::new();
        DeflateDecoder::new(stored.as_slice())
            .take(MAX_SECTION as u64)
            .read_to_end(&mut inflated)
            .map_err(|e| BackupError::corrupt(format!("inflate section {}: {}", self.index, e)))?;

        self.current = inflated;
        self.pos = 0;
        self.index += 1;
        Ok(true)
    }

    fn byte(&mut self) -> BackupResult<Option<u8>> {
        while self.pos >= self.current.len() {
            if !self.next_section()? {
                return Ok(None);
            }
        }
        let b = self.current[self.pos];
        self.pos += 1;
        Ok(Some(b))
    }

    fn require_byte(&mut self) -> BackupResult<u8> {
        self.byte()?
            .ok_or_else(|| BackupError::corrupt("token cut short by end of dump"))
    }

    fn bytes(&mut self, mut len: usize) -> BackupResult<Vec<u8>> {
        let mut out = Vec::with_capacity(len.min(SECTION_TARGET));
        while len > 0 {
            if self.pos >= self.current.len() && !self.next_section()? {
                return Err(BackupError::corrupt("value cut short by end of dump"));
            }
            let take = len.min(self.current.len() - self.pos);
            out.extend_from_slice(&self.current[self.pos..self.pos + take]);
            self.pos += take;
            len -= take;
        }
        Ok(out)
    }

    fn varint(&mut self) -> BackupResult<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let byte = self.require_byte()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(BackupError::corrupt("varint longer than 10 bytes"))
    }

    fn length(&mut self) -> BackupResult<usize> {
        let len = self.varint()?;
        usize::try_from(len)
            .ok()
            .filter(|n| *n <= MAX_SECTION * 64)
            .ok_or_else(|| BackupError::corrupt(format!("length {} out of range", len)))
    }

    fn text(&mut self, len: usize) -> BackupResult<String> {
        Ok(String::from_utf8_lossy(&self.bytes(len)?).into_owned())
    }

    fn tagged_value(&mut self, tag: u8) -> BackupResult<Value> {
        Ok(match tag {
            BIND_NULL => Value::Null,
            BIND_VARINT => Value::Integer(self.varint()? as i64),
            BIND_VARINT_MINUS => Value::Integer(!(self.varint()? as i64)),
            BIND_FLOAT => {
                let raw = self.bytes(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&raw);
                Value::Real(f64::from_le_bytes(buf))
            }
            BIND_TEXT => {
                let len = self.length()?;
                Value::Text(self.text(len)?)
            }
            BIND_TEXT_SHORT => {
                let len = self.require_byte()? as usize;
                Value::Text(self.text(len)?)
            }
            BIND_BLOB => {
                let len = self.length()?;
                Value::Blob(self.bytes(len)?)
            }
            BIND_BLOB_SHORT => {
                let len = self.require_byte()? as usize;
                Value::Blob(self.bytes(len)?)
            }
            other => return Err(BackupError::corrupt(format!("unknown bind tag {:#x}", other))),
        })
    }

    /// Next token, or `None` at the end marker.
    pub fn next_token(&mut self) -> BackupResult<Option<Token>> {
        let Some(tag) = self.byte()? else {
            return Ok(None);
        };
        let token = match tag {
            SQL_ONESHOT => {
                let len = self.length()?;
                Token::OneShot(self.text(len)?)
            }
            SQL_REPEATED => {
                let len = self.length()?;
                Token::Repeated(self.text(len)?)
            }
            END_ROW => Token::EndRow,
            END_SQL => Token::EndSql,
            LARGE_DATA => {
                let kind = self.require_byte()?;
                if kind != BIND_TEXT && kind != BIND_BLOB {
                    return Err(BackupError::corrupt(format!("large data of kind {:#x}", kind)));
                }
                Token::Bind(self.tagged_value(kind)?)
            }
            tag => Token::Bind(self.tagged_value(tag)?),
        };
        Ok(Some(token))
    }
}

fn read_exact_or_corrupt<R: Read>(input: &mut R, buf: &mut [u8], what: &str) -> BackupResult<()> {
    input.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => BackupError::corrupt(format!("{} truncated", what)),
        _ => BackupError::io(format!("read {}", what), e),
    })
}
