//! Raw read/write retry helpers shared by `Message` and the upstream client.
//!
//! EINTR is always retried immediately, no matter how much progress has been
//! made in the current call. Any other error ends the loop: if earlier reads
//! or writes in this same call already moved some bytes, that partial count
//! is returned as success (a short read/write, not an error); only a first
//! attempt that transfers zero bytes before failing propagates the error.

use std::io::{self, Read, Write};

pub fn read_full<R: Read + ?Sized>(stream: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match stream.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if total != 0 {
                    break;
                }
                return Err(e);
            }
        }
    }
    Ok(total)
}

pub fn write_full<W: Write + ?Sized>(stream: &mut W, buf: &[u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match stream.write(&buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if total != 0 {
                    break;
                }
                return Err(e);
            }
        }
    }
    Ok(total)
}

/// Like [`read_full`] but treats anything short of `buf.len()` as an error.
pub fn read_exact_or_err<R: Read + ?Sized>(stream: &mut R, buf: &mut [u8]) -> io::Result<()> {
    let n = read_full(stream, buf)?;
    if n != buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "short read on framed socket",
        ));
    }
    Ok(())
}

/// Like [`write_full`] but treats anything short of `buf.len()` as an error.
pub fn write_all_or_err<W: Write + ?Sized>(stream: &mut W, buf: &[u8]) -> io::Result<()> {
    let n = write_full(stream, buf)?;
    if n != buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            "short write on framed socket",
        ));
    }
    Ok(())
}

/// Copies exactly `len` bytes from `src` to `dst` (or discards them if `dst`
/// is `None`), in fixed-size chunks so oversize transfers never buffer the
/// whole payload at once.
pub fn stream_bytes<R, W>(src: &mut R, mut dst: Option<&mut W>, mut len: usize) -> io::Result<()>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let mut chunk = [0u8; 8192];
    while len > 0 {
        let take = len.min(chunk.len());
        read_exact_or_err(src, &mut chunk[..take])?;
        if let Some(d) = dst.as_deref_mut() {
            write_all_or_err(d, &chunk[..take])?;
        }
        len -= take;
    }
    Ok(())
}
