use crate::error::{Error, Result};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

// Growth increment for transform output buffers
const OUT_CHUNK: usize = 8 * 1024;

/// ZlibStage carries one zlib stream per traffic direction: `compress`
/// deflates server-to-client buffers, `decompress` inflates
/// client-to-server buffers. Every deflated buffer ends on a sync flush
/// so the peer can inflate it without waiting for more input
pub struct ZlibStage {
    deflate: Compress,
    inflate: Decompress,
}

/// ZlibStage implementation block
impl ZlibStage {
    /// new creates both direction streams with zlib framing
    pub fn new() -> Self {
        Self {
            deflate: Compress::new(Compression::default(), true),
            inflate: Decompress::new(true),
        }
    }

    /// compress deflates one buffer, sync-flushed
    pub fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        let start = self.deflate.total_in();

        loop {
            let consumed = (self.deflate.total_in() - start) as usize;
            let status = self
                .deflate
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Sync)
                .map_err(|e| Error::Codec(format!("deflate failed: {e}")))?;
            let consumed = (self.deflate.total_in() - start) as usize;

            match status {
                Status::Ok | Status::BufError => {
                    // Done once all input is taken and the flush had room
                    if consumed == data.len() && out.len() < out.capacity() {
                        break;
                    }
                    out.reserve(OUT_CHUNK);
                }
                Status::StreamEnd => break,
            }
        }

        Ok(out)
    }

    /// decompress inflates bytes produced by the peer's sync-flushed
    /// deflate stream; any byte partitioning of that stream is accepted
    pub fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 2 + 64);
        let start = self.inflate.total_in();

        loop {
            let consumed = (self.inflate.total_in() - start) as usize;
            let status = self
                .inflate
                .decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync)
                .map_err(|e| Error::Codec(format!("corrupt deflate stream: {e}")))?;
            let consumed = (self.inflate.total_in() - start) as usize;

            match status {
                Status::Ok | Status::BufError => {
                    if consumed == data.len() && out.len() < out.capacity() {
                        break;
                    }
                    out.reserve(OUT_CHUNK);
                }
                Status::StreamEnd => break,
            }
        }

        Ok(out)
    }
}

impl Default for ZlibStage {
    fn default() -> Self {
        Self::new()
    }
}
