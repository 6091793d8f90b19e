//! Minimal RIFF/WAV plumbing for stitching synthesis chunks together.
//!
//! The voice service returns one WAV per chunk, all from the same model at
//! the same sample rate; assembly is a header-aware byte concatenation.

use crate::error::{Error, Result};

const RIFF_HEADER_LEN: usize = 44;

/// PCM format fields from the `fmt ` chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

impl WavFormat {
    fn bytes_per_second(&self) -> u32 {
        self.sample_rate * self.channels as u32 * (self.bits_per_sample as u32 / 8)
    }
}

struct ParsedWav<'a> {
    format: WavFormat,
    data: &'a [u8],
}

/// Concatenate WAV payloads into a single WAV whose audio duration is the
/// sum of the inputs. The single-chunk case passes through unchanged.
pub fn concat(chunks: &[Vec<u8>]) -> Result<Vec<u8>> {
    match chunks {
        [] => Err(Error::AssembleFailed("no audio chunks to combine".into())),
        [only] => Ok(only.clone()),
        _ => {
            let mut format: Option<WavFormat> = None;
            let mut total_data = 0usize;
            let mut parsed = Vec::with_capacity(chunks.len());

            for (idx, chunk) in chunks.iter().enumerate() {
                let wav = parse(chunk).map_err(|err| {
                    Error::AssembleFailed(format!("chunk {idx}: {err}"))
                })?;
                match format {
                    None => format = Some(wav.format),
                    Some(expected) if expected != wav.format => {
                        return Err(Error::AssembleFailed(format!(
                            "chunk {idx} format {:?} does not match {:?}",
                            wav.format, expected
                        )));
                    }
                    Some(_) => {}
                }
                total_data += wav.data.len();
                parsed.push(wav);
            }

            let format = format.expect("at least two chunks parsed");
            let mut out = Vec::with_capacity(RIFF_HEADER_LEN + total_data);
            write_header(&mut out, format, total_data);
            for wav in parsed {
                out.extend_from_slice(wav.data);
            }
            Ok(out)
        }
    }
}

/// Wrap raw PCM samples in a canonical 44-byte WAV header.
pub fn from_pcm(pcm: &[u8], format: WavFormat) -> Vec<u8> {
    let mut out = Vec::with_capacity(RIFF_HEADER_LEN + pcm.len());
    write_header(&mut out, format, pcm.len());
    out.extend_from_slice(pcm);
    out
}

/// Audio duration of a WAV payload in seconds.
pub fn duration_secs(bytes: &[u8]) -> Result<f64> {
    let wav = parse(bytes).map_err(Error::AssembleFailed)?;
    let rate = wav.format.bytes_per_second();
    if rate == 0 {
        return Err(Error::AssembleFailed("zero byte rate in fmt chunk".into()));
    }
    Ok(wav.data.len() as f64 / rate as f64)
}

fn parse(bytes: &[u8]) -> std::result::Result<ParsedWav<'_>, String> {
    if bytes.len() < RIFF_HEADER_LEN {
        return Err(format!("payload too short for a WAV header: {} bytes", bytes.len()));
    }
    if &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WAVE" {
        return Err("missing RIFF/WAVE magic".into());
    }

    let mut format: Option<WavFormat> = None;
    let mut data: Option<&[u8]> = None;
    let mut offset = 12usize;

    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        let size = u32::from_le_bytes(
            bytes[offset + 4..offset + 8]
                .try_into()
                .expect("4-byte slice"),
        ) as usize;
        let body_start = offset + 8;
        let body_end = body_start.saturating_add(size).min(bytes.len());

        match id {
            b"fmt " => {
                if size < 16 {
                    return Err(format!("fmt chunk too short: {size} bytes"));
                }
                let fmt = &bytes[body_start..body_start + 16];
                format = Some(WavFormat {
                    channels: u16::from_le_bytes([fmt[2], fmt[3]]),
                    sample_rate: u32::from_le_bytes([fmt[4], fmt[5], fmt[6], fmt[7]]),
                    bits_per_sample: u16::from_le_bytes([fmt[14], fmt[15]]),
                });
            }
            b"data" => {
                data = Some(&bytes[body_start..body_end]);
            }
            _ => {}
        }

        // Chunks are word-aligned; odd sizes carry a pad byte.
        offset = body_start + size + (size & 1);
    }

    match (format, data) {
        (Some(format), Some(data)) => Ok(ParsedWav { format, data }),
        (None, _) => Err("missing fmt chunk".into()),
        (_, None) => Err("missing data chunk".into()),
    }
}

fn write_header(out: &mut Vec<u8>, format: WavFormat, data_len: usize) {
    let block_align = format.channels * (format.bits_per_sample / 8);
    let byte_rate = format.bytes_per_second();

    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&((36 + data_len) as u32).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&format.channels.to_le_bytes());
    out.extend_from_slice(&format.sample_rate.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&format.bits_per_sample.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&(data_len as u32).to_le_bytes());
}
