use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use std::{
  error::Error,
  fmt, io,
  io::{Cursor, Read, Write},
  ops::{Deref, DerefMut},
  string::FromUtf8Error,
};

pub type Result<T> = std::result::Result<T, BufferError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  Reading,
  Writing,
}

use Mode::Reading;

/// An error produced while reading from or writing to a [`Buffer`]. This
/// includes the index at which the error occurred, which makes malformed
/// packets much easier to diagnose.
#[derive(Debug)]
pub struct BufferError {
  err:  BufferErrorKind,
  pos:  u64,
  mode: Mode,
}

impl BufferError {
  pub fn kind(&self) -> &BufferErrorKind { &self.err }
}

impl fmt::Display for BufferError {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    if self.mode == Mode::Reading {
      write!(f, "error while reading from buffer at index {}: {}", self.pos, self.err)
    } else {
      write!(f, "error while writing to buffer at index {}: {}", self.pos, self.err)
    }
  }
}

#[derive(Debug)]
pub enum BufferErrorKind {
  /// A varint used a continuation bit in its fifth byte.
  VarInt,
  IO(io::Error),
  FromUtf8Error(FromUtf8Error),
  StringTooLong { len: u64, max: u64 },
  NegativeLen(i32),
}

impl fmt::Display for BufferErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Self::VarInt => write!(f, "varint is too long"),
      Self::IO(e) => write!(f, "{}", e),
      Self::FromUtf8Error(e) => write!(f, "{}", e),
      Self::StringTooLong { len, max } => {
        write!(f, "string is `{}` characters, longer than max `{}`", len, max)
      }
      Self::NegativeLen(len) => write!(f, "len `{}` is negative", len),
    }
  }
}

impl Error for BufferError {}

impl From<io::Error> for BufferErrorKind {
  fn from(e: io::Error) -> Self { BufferErrorKind::IO(e) }
}
impl From<FromUtf8Error> for BufferErrorKind {
  fn from(e: FromUtf8Error) -> Self { BufferErrorKind::FromUtf8Error(e) }
}

/// A cursor over a byte buffer, with all the read and write primitives the
/// wire protocol uses: big-endian integers, varints, and varint
/// length-prefixed strings.
#[derive(Debug)]
pub struct Buffer<T> {
  data: Cursor<T>,
}

macro_rules! add_read {
  ($fn: ident, $ty: ty) => {
    pub fn $fn(&mut self) -> Result<$ty> {
      self.data.$fn::<BigEndian>().map_err(|e| self.err(e, Reading))
    }
  };
}
// The same as add_read(), but with no type parameter
macro_rules! add_read_byte {
  ($fn: ident, $ty: ty) => {
    pub fn $fn(&mut self) -> Result<$ty> { self.data.$fn().map_err(|e| self.err(e, Reading)) }
  };
}

macro_rules! add_write {
  ($fn: ident, $ty: ty) => {
    pub fn $fn(&mut self, v: $ty) {
      self.data.$fn::<BigEndian>(v).expect("could not write to buffer")
    }
  };
}
// The same as add_write(), but with no type parameter
macro_rules! add_write_byte {
  ($fn: ident, $ty: ty) => {
    pub fn $fn(&mut self, v: $ty) { self.data.$fn(v).expect("could not write to buffer") }
  };
}

impl<T> Buffer<T> {
  pub fn new(data: T) -> Self { Buffer { data: Cursor::new(data) } }

  pub fn err(&self, e: impl Into<BufferErrorKind>, mode: Mode) -> BufferError {
    BufferError { err: e.into(), pos: self.data.position(), mode }
  }

  pub fn into_inner(self) -> T { self.data.into_inner() }
}

impl<T> Buffer<T>
where
  T: AsRef<[u8]>,
{
  pub fn len(&self) -> usize { self.data.get_ref().as_ref().len() }
  pub fn is_empty(&self) -> bool { self.len() == 0 }
  pub fn index(&self) -> usize { self.data.position() as usize }
  pub fn remaining(&self) -> usize { self.len().saturating_sub(self.index()) }

  pub fn read_bool(&mut self) -> Result<bool> { Ok(self.read_u8()? != 0) }
  add_read_byte!(read_u8, u8);
  add_read!(read_u16, u16);
  add_read!(read_u32, u32);
  add_read!(read_u64, u64);
  add_read_byte!(read_i8, i8);
  add_read!(read_i16, i16);
  add_read!(read_i32, i32);
  add_read!(read_i64, i64);

  add_read!(read_f32, f32);
  add_read!(read_f64, f64);

  /// Reads everything from the cursor to the end of the buffer.
  pub fn read_all(&mut self) -> Vec<u8> {
    let mut buf = vec![];
    match self.data.read_to_end(&mut buf) {
      Ok(_) => buf,
      Err(e) => panic!("failed to read all: {:?}", e),
    }
  }

  pub fn read_buf(&mut self, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0; len];
    self.data.read_exact(&mut buf).map_err(|e| self.err(e, Reading))?;
    Ok(buf)
  }

  /// Reads a string. If the length is longer than the given maximum, this will
  /// fail, and return an error.
  pub fn read_str(&mut self, max_len: u64) -> Result<String> {
    let len = self.read_varint()?;
    let len: u64 =
      len.try_into().map_err(|_| self.err(BufferErrorKind::NegativeLen(len), Reading))?;
    if len > max_len * 4 {
      return Err(self.err(BufferErrorKind::StringTooLong { len, max: max_len }, Reading));
    }
    let vec = self.read_buf(len as usize)?;
    match String::from_utf8(vec) {
      Ok(v) => {
        // The length prefix bounds the bytes; this bounds the characters.
        let chars = v.chars().count() as u64;
        if chars > max_len {
          Err(self.err(BufferErrorKind::StringTooLong { len: chars, max: max_len }, Reading))
        } else {
          Ok(v)
        }
      }
      Err(e) => Err(self.err(e, Reading)),
    }
  }

  pub fn read_varint(&mut self) -> Result<i32> {
    let mut res: i32 = 0;
    for i in 0..5 {
      let read = self.read_u8()?;
      if i == 4 && read & 0b10000000 != 0 {
        return Err(self.err(BufferErrorKind::VarInt, Reading));
      }

      let v = read & 0b01111111;
      res |= (v as i32) << (7 * i);

      if read & 0b10000000 == 0 {
        break;
      }
    }
    Ok(res)
  }
}

impl<T> Buffer<T>
where
  Cursor<T>: io::Write,
{
  pub fn write_bool(&mut self, v: bool) {
    if v {
      self.write_u8(1);
    } else {
      self.write_u8(0);
    }
  }
  add_write_byte!(write_u8, u8);
  add_write!(write_u16, u16);
  add_write!(write_u32, u32);
  add_write!(write_u64, u64);
  add_write_byte!(write_i8, i8);
  add_write!(write_i16, i16);
  add_write!(write_i32, i32);
  add_write!(write_i64, i64);

  add_write!(write_f32, f32);
  add_write!(write_f64, f64);

  /// This doesn't return a result, as the only thing that could go wrong is an
  /// oom error, which isn't even returned as an error.
  pub fn write_buf(&mut self, v: &[u8]) { self.data.write_all(v).expect("could not write buf") }

  pub fn write_str(&mut self, v: &str) {
    self.write_varint(v.len() as i32);
    self.write_buf(v.as_bytes());
  }

  pub fn write_varint(&mut self, v: i32) {
    // Need to work with u32, as >> acts differently on i32 vs u32.
    let mut val = v as u32;
    for _ in 0..5 {
      let mut b: u8 = val as u8 & 0b01111111;
      val >>= 7;
      if val != 0 {
        b |= 0b10000000;
      }
      self.write_u8(b);
      if val == 0 {
        break;
      }
    }
  }
}

/// Reads a varint from the front of `data`, without needing the whole buffer
/// to be present. Returns `(value, bytes_read)`, where `bytes_read` is `0` if
/// the varint is incomplete, and `-1` if it is longer than 5 bytes.
pub fn read_partial_varint(data: &[u8]) -> (i32, isize) {
  let mut res: i32 = 0;
  for i in 0..5 {
    let Some(&read) = data.get(i) else { return (0, 0) };
    if i == 4 && read & 0b10000000 != 0 {
      return (0, -1);
    }
    res |= ((read & 0b01111111) as i32) << (7 * i);
    if read & 0b10000000 == 0 {
      return (res, i as isize + 1);
    }
  }
  (0, -1)
}

/// Returns the number of bytes [`write_varint`](Buffer::write_varint) would
/// produce for the given value. Always within `1..=5`.
pub fn varint_len(v: i32) -> usize {
  let mut val = v as u32;
  let mut len = 1;
  while val >= 0x80 {
    val >>= 7;
    len += 1;
  }
  len
}

impl<T> Deref for Buffer<T> {
  type Target = T;

  fn deref(&self) -> &Self::Target { self.data.get_ref() }
}

impl<T> DerefMut for Buffer<T> {
  fn deref_mut(&mut self) -> &mut Self::Target { self.data.get_mut() }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  pub fn read_varint() {
    let mut buf = Buffer::new(vec![1]);
    assert_eq!(1, buf.read_varint().unwrap());

    let mut buf = Buffer::new(vec![127]);
    assert_eq!(127, buf.read_varint().unwrap());

    let mut buf = Buffer::new(vec![128, 2]);
    assert_eq!(256, buf.read_varint().unwrap());

    let mut buf = Buffer::new(vec![255, 255, 255, 255, 15]);
    assert_eq!(-1, buf.read_varint().unwrap());

    let mut buf = Buffer::new(vec![255, 255, 255, 255, 255]);
    assert!(buf.read_varint().is_err());
  }

  #[test]
  pub fn write_varint() {
    let mut data = vec![];
    let mut buf = Buffer::new(&mut data);
    buf.write_varint(1);
    assert_eq!(vec![1], data);

    let mut data = vec![];
    let mut buf = Buffer::new(&mut data);
    buf.write_varint(127);
    assert_eq!(vec![127], data);

    let mut data = vec![];
    let mut buf = Buffer::new(&mut data);
    buf.write_varint(256);
    assert_eq!(vec![128, 2], data);

    let mut data = vec![];
    let mut buf = Buffer::new(&mut data);
    buf.write_varint(-1);
    assert_eq!(vec![255, 255, 255, 255, 15], data);
  }

  #[test]
  pub fn varint_round_trip() {
    // A sample of the positive range, including every length boundary.
    for n in
      [0, 1, 127, 128, 255, 16383, 16384, 2097151, 2097152, 268435455, 268435456, i32::MAX]
    {
      let mut data = vec![];
      let mut buf = Buffer::new(&mut data);
      buf.write_varint(n);
      assert_eq!(data.len(), varint_len(n));
      assert!((1..=5).contains(&data.len()));
      let mut buf = Buffer::new(data);
      assert_eq!(n, buf.read_varint().unwrap());
    }
  }

  #[test]
  pub fn partial_varint() {
    assert_eq!(read_partial_varint(&[]), (0, 0));
    assert_eq!(read_partial_varint(&[128]), (0, 0));
    assert_eq!(read_partial_varint(&[1]), (1, 1));
    assert_eq!(read_partial_varint(&[128, 2]), (256, 2));
    assert_eq!(read_partial_varint(&[128, 2, 99]), (256, 2));
    assert_eq!(read_partial_varint(&[255, 255, 255, 255, 255]), (0, -1));
  }

  #[test]
  pub fn strings() {
    let mut data = vec![];
    let mut buf = Buffer::new(&mut data);
    buf.write_str("big gaming");
    let mut buf = Buffer::new(data);
    assert_eq!("big gaming", buf.read_str(16).unwrap());

    let mut data = vec![];
    let mut buf = Buffer::new(&mut data);
    buf.write_str("this is too long");
    let mut buf = Buffer::new(data);
    assert!(buf.read_str(2).is_err());
  }
}
