//! Batch payload compression for save paths.
//!
//! A save rewrites every dirty entry's payload.  The compression of those
//! payloads is independent per entry, so the batch can run concurrently;
//! writing stays sequential because on-disk order is insertion order.
//!
//! With the `parallel` feature the batch fans out over Rayon; without it the
//! same code runs sequentially, so the save path behaves identically either
//! way.

use crate::codec::{self, CodecError};

/// One payload awaiting compression: the frame tag to use and the
/// uncompressed bytes.
#[derive(Debug, Clone, Copy)]
pub struct CompressJob<'a> {
    pub tag: u16,
    pub src: &'a [u8],
}

/// Frame-compress every job, preserving order.
///
/// Each output inflates back to exactly its input length; the first failing
/// job aborts the batch.
pub fn compress_batch(jobs: &[CompressJob<'_>]) -> Result<Vec<Vec<u8>>, CodecError> {
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;

        jobs.par_iter()
            .map(|job| codec::compress_framed(job.tag, job.src))
            .collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        jobs.iter()
            .map(|job| codec::compress_framed(job.tag, job.src))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decompress_framed, TAG_DEFLATE, TAG_ZLIB};

    #[test]
    fn batch_preserves_order_and_roundtrips() {
        let payloads: Vec<Vec<u8>> = (0..8u8)
            .map(|i| (0..512).map(|j| (j as u8).wrapping_mul(i)).collect())
            .collect();
        let jobs: Vec<CompressJob<'_>> = payloads
            .iter()
            .enumerate()
            .map(|(i, p)| CompressJob {
                tag: if i % 2 == 0 { TAG_DEFLATE } else { TAG_ZLIB },
                src: p,
            })
            .collect();

        let framed = compress_batch(&jobs).unwrap();
        assert_eq!(framed.len(), payloads.len());
        for (frame, payload) in framed.iter().zip(&payloads) {
            assert_eq!(&decompress_framed(frame, payload.len()).unwrap(), payload);
        }
    }

    #[test]
    fn unsupported_tag_fails_the_batch() {
        let jobs = [CompressJob { tag: 0x5A42, src: b"x" }];
        assert!(compress_batch(&jobs).is_err());
    }
}
