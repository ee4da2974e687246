//! 페이로드 압축
//!
//! 압축을 켠 엔드포인트의 애플리케이션 페이로드 앞에는 1바이트 표시가 붙는다.
//! `0` = 원본, `1` = zlib. 임계값보다 작거나 압축해도 줄지 않으면 원본을 보낸다.

use std::io::{self, Read, Write};

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

const RAW: u8 = 0;
const ZLIB: u8 = 1;

/// 압축 해제 결과 상한
pub const MAX_DECOMPRESSED_SIZE: usize = 1 << 20;

/// 페이로드를 표시 바이트와 함께 압축
pub fn compress(data: &[u8], threshold: usize) -> io::Result<Bytes> {
    if data.len() >= threshold {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2 + 1), Compression::default());
        encoder.write_all(data)?;
        let compressed = encoder.finish()?;
        if compressed.len() < data.len() {
            return Ok(frame(ZLIB, &compressed));
        }
    }
    Ok(frame(RAW, data))
}

/// 표시 바이트를 읽고 원본 페이로드 복원
pub fn decompress(data: &[u8]) -> io::Result<Bytes> {
    let Some((&marker, body)) = data.split_first() else {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "압축 표시 바이트 없음"));
    };

    match marker {
        RAW => Ok(Bytes::copy_from_slice(body)),
        ZLIB => {
            let mut out = Vec::new();
            ZlibDecoder::new(body)
                .take(MAX_DECOMPRESSED_SIZE as u64 + 1)
                .read_to_end(&mut out)?;
            if out.len() > MAX_DECOMPRESSED_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("압축 해제 크기 상한 초과: {} bytes", MAX_DECOMPRESSED_SIZE),
                ));
            }
            Ok(Bytes::from(out))
        }
        other => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("알 수 없는 압축 표시: {}", other),
        )),
    }
}

fn frame(marker: u8, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(body.len() + 1);
    buf.put_u8(marker);
    buf.put_slice(body);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_payload_is_sent_raw() {
        let framed = compress(b"hi", 16).unwrap();
        assert_eq!(framed[0], RAW);
        assert_eq!(&framed[1..], b"hi");
        assert_eq!(decompress(&framed).unwrap(), Bytes::from_static(b"hi"));
    }

    #[test]
    fn test_repetitive_payload_shrinks() {
        let data = vec![b'a'; 4096];
        let framed = compress(&data, 16).unwrap();
        assert_eq!(framed[0], ZLIB);
        assert!(framed.len() < data.len() / 10);
        assert_eq!(decompress(&framed).unwrap(), Bytes::from(data));
    }

    #[test]
    fn test_incompressible_payload_stays_raw() {
        // 짧은 무작위 바이트는 zlib 헤더 때문에 오히려 커진다
        let data: Vec<u8> = (0..40u8).map(|i| i.wrapping_mul(97).wrapping_add(13)).collect();
        let framed = compress(&data, 16).unwrap();
        assert_eq!(framed[0], RAW);
        assert_eq!(framed.len(), data.len() + 1);
    }

    #[test]
    fn test_rejects_bad_frames() {
        assert!(decompress(&[]).is_err());
        assert!(decompress(&[7, 1, 2]).is_err());
        assert!(decompress(&[ZLIB, 0xFF, 0x00, 0x12]).is_err());
    }

    #[test]
    fn test_decompression_is_bounded() {
        let data = vec![0u8; MAX_DECOMPRESSED_SIZE + 1];
        let framed = compress(&data, 16).unwrap();
        assert_eq!(framed[0], ZLIB);
        assert!(decompress(&framed).is_err());
    }
}
