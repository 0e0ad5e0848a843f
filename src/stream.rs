//! Append-only streams of fixed-size records.
//!
//! Each output array of a capture is built through a [`Stream`]: a
//! buffered writer on top of an anonymous temporary file. Once decoding
//! ends the stream is finalized, which flushes the buffer and maps the
//! file read-only, turning it into a directly addressable [`Array`].
//! The backing file has no on-disk path and lives exactly as long as
//! its mapping.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::Deref;

use bytemuck::Pod;
use log::debug;
use memmap2::Mmap;

use crate::CaptureError;

fn stream_err(name: &str, source: std::io::Error) -> CaptureError {
    CaptureError::Stream {
        name: name.to_string(),
        source,
    }
}

/// An append-only sequence of `T` records being written out.
pub struct Stream<T> {
    name: String,
    writer: BufWriter<File>,
    len: u64,
    _marker: PhantomData<T>,
}

impl<T: Pod> Stream<T> {
    /// Create a stream backed by a fresh anonymous file. The name is
    /// advisory, used for diagnostics only.
    pub fn new(name: impl Into<String>) -> Result<Self, CaptureError> {
        let name = name.into();
        let file = tempfile::tempfile().map_err(|e| stream_err(&name, e))?;
        Ok(Stream {
            name,
            writer: BufWriter::new(file),
            len: 0,
            _marker: PhantomData,
        })
    }

    /// Append one record, returning the index it will occupy.
    pub fn push(&mut self, item: &T) -> Result<u64, CaptureError> {
        self.writer
            .write_all(bytemuck::bytes_of(item))
            .map_err(|e| stream_err(&self.name, e))?;
        let id = self.len;
        self.len += 1;
        Ok(id)
    }

    /// Number of records appended so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flush buffered records and map the backing file read-only.
    pub fn finalize(self) -> Result<Array<T>, CaptureError> {
        let name = self.name;
        let file = self
            .writer
            .into_inner()
            .map_err(|e| stream_err(&name, e.into_error()))?;
        let map = if self.len == 0 {
            // A zero-length file cannot be mapped; an empty array needs
            // no backing at all.
            None
        } else {
            // The file is anonymous and this was its only writer, so
            // the mapped contents cannot change underneath us.
            let map = unsafe { Mmap::map(&file) }.map_err(|e| stream_err(&name, e))?;
            Some(map)
        };
        debug!(
            "stream {}: finalized {} records ({} bytes)",
            name,
            self.len,
            self.len * size_of::<T>() as u64
        );
        Ok(Array {
            map,
            len: self.len,
            _marker: PhantomData,
        })
    }
}

impl Stream<u8> {
    /// Append raw bytes, returning the offset at which they begin.
    pub fn append(&mut self, bytes: &[u8]) -> Result<u64, CaptureError> {
        self.writer
            .write_all(bytes)
            .map_err(|e| stream_err(&self.name, e))?;
        let offset = self.len;
        self.len += bytes.len() as u64;
        Ok(offset)
    }
}

/// A finalized stream: a read-only mapping viewed as a `[T]` slice.
pub struct Array<T> {
    map: Option<Mmap>,
    len: u64,
    _marker: PhantomData<T>,
}

impl<T: Pod> Array<T> {
    /// Number of records in the array.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[T] {
        match &self.map {
            None => &[],
            Some(map) => {
                let bytes = self.len as usize * size_of::<T>();
                bytemuck::cast_slice(&map[..bytes])
            }
        }
    }

    pub fn get(&self, index: u64) -> Option<&T> {
        self.as_slice().get(index as usize)
    }
}

impl<T: Pod> Deref for Array<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.as_slice()
    }
}

impl<T: Pod + std::fmt::Debug> std::fmt::Debug for Array<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}
