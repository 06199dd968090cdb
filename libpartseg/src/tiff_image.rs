//! TIFF serialization of [`Image`].
//!
//! Images are written as ImageJ-style hyperstacks: one 16-bit grayscale page
//! per (layer, channel) pair, channel varying fastest. The first page carries
//! an `ImageDescription` with the stack geometry and the exact spacing, so a
//! written image decodes back bit-for-bit.

use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, Write};

use ndarray::{s, Array4};
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};
use tiff::tags::Tag;

use crate::error::{PartSegError, Result};
use crate::image::{Image, ImageReader, DEFAULT_SPACING};
use crate::source::ByteSource;

const IMAGEJ_VERSION: &str = "1.11a";
const SPACING_KEY: &str = "partseg_spacing";
const CHANNEL_NAMES_KEY: &str = "partseg_channel_names";

/// Reader for TIFF / LSM-as-TIFF stacks
#[derive(Debug, Default, Clone, Copy)]
pub struct TiffImageReader;

impl ImageReader for TiffImageReader {
    fn read_image(&self, source: ByteSource<'_>) -> Result<Image> {
        let bytes = source.read_all()?;
        decode_image(Cursor::new(bytes))
    }
}

/// Serialize an image into TIFF bytes
pub fn encode_image(image: &Image) -> Result<Vec<u8>> {
    let mut cursor = Cursor::new(Vec::new());
    write_image(&mut cursor, image)?;
    Ok(cursor.into_inner())
}

/// Write an image as a multi-page TIFF
pub fn write_image<W: Write + Seek>(writer: &mut W, image: &Image) -> Result<()> {
    let [layers, height, width] = image.spatial_shape();
    let channels = image.channels();
    let (width, height) = (to_u32(width)?, to_u32(height)?);
    let description = describe(image);

    let mut encoder = TiffEncoder::new(writer)?;
    for layer in 0..layers {
        for channel in 0..channels {
            let page: Vec<u16> = image
                .data()
                .slice(s![layer, .., .., channel])
                .iter()
                .copied()
                .collect();
            let mut page_encoder = encoder.new_image::<colortype::Gray16>(width, height)?;
            if layer == 0 && channel == 0 {
                page_encoder
                    .encoder()
                    .write_tag(Tag::ImageDescription, description.as_str())?;
            }
            page_encoder.write_data(&page)?;
        }
    }
    Ok(())
}

/// Decode a TIFF stream into an image
pub fn decode_image<R: Read + Seek>(reader: R) -> Result<Image> {
    let mut decoder = Decoder::new(reader)?;
    let description = decoder
        .get_tag_ascii_string(Tag::ImageDescription)
        .ok()
        .map(|text| parse_description(&text))
        .unwrap_or_default();

    let (width, height) = decoder.dimensions()?;
    let mut pages = Vec::new();
    loop {
        if decoder.dimensions()? != (width, height) {
            return Err(PartSegError::Image(
                "all pages of a stack must share dimensions".to_string(),
            ));
        }
        pages.push(widen_page(decoder.read_image()?)?);
        if !decoder.more_images() {
            break;
        }
        decoder.next_image()?;
    }

    let channels = description
        .get("channels")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(1);
    if channels == 0 || pages.len() % channels != 0 {
        return Err(PartSegError::Image(format!(
            "{} pages cannot be split into {channels} channels",
            pages.len()
        )));
    }
    let layers = pages.len() / channels;
    if let Some(slices) = description.get("slices").and_then(|v| v.parse::<usize>().ok()) {
        if slices != layers {
            return Err(PartSegError::Image(format!(
                "description declares {slices} slices, file holds {layers}"
            )));
        }
    }

    let (height, width) = (height as usize, width as usize);
    let mut data = Array4::<u16>::zeros((layers, height, width, channels));
    for (index, page) in pages.iter().enumerate() {
        if page.len() != height * width {
            return Err(PartSegError::Image(format!(
                "page {index} holds {} samples, expected {}",
                page.len(),
                height * width
            )));
        }
        let (layer, channel) = (index / channels, index % channels);
        let mut target = data.slice_mut(s![layer, .., .., channel]);
        for (dst, src) in target.iter_mut().zip(page) {
            *dst = *src;
        }
    }

    let spacing = description
        .get(SPACING_KEY)
        .map(|v| parse_spacing(v))
        .transpose()?
        .unwrap_or(DEFAULT_SPACING);
    let mut image = Image::new(data, spacing)?;
    if let Some(names) = description.get(CHANNEL_NAMES_KEY) {
        let names: Vec<String> = serde_json::from_str(names)?;
        image = image.with_channel_names(names)?;
    }
    Ok(image)
}

fn describe(image: &Image) -> String {
    let [z, y, x] = image.spacing();
    let names = serde_json::to_string(image.channel_names()).unwrap_or_else(|_| "[]".to_string());
    format!(
        "ImageJ={IMAGEJ_VERSION}\nimages={images}\nchannels={channels}\nslices={slices}\n\
         hyperstack=true\nmode=composite\nunit=m\nspacing={z}\n\
         {SPACING_KEY}={z},{y},{x}\n{CHANNEL_NAMES_KEY}={names}\n",
        images = image.layers() * image.channels(),
        channels = image.channels(),
        slices = image.layers(),
    )
}

fn parse_description(text: &str) -> HashMap<String, String> {
    text.lines()
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

fn parse_spacing(value: &str) -> Result<[f64; 3]> {
    let parsed: Vec<f64> = value
        .split(',')
        .map(|part| part.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| PartSegError::Image(format!("invalid spacing `{value}`: {e}")))?;
    <[f64; 3]>::try_from(parsed)
        .map_err(|_| PartSegError::Image(format!("spacing `{value}` must have three values")))
}

fn widen_page(result: DecodingResult) -> Result<Vec<u16>> {
    match result {
        DecodingResult::U16(data) => Ok(data),
        DecodingResult::U8(data) => Ok(data.into_iter().map(u16::from).collect()),
        _ => Err(PartSegError::Image(
            "only 8 and 16 bit grayscale pages are supported".to_string(),
        )),
    }
}

fn to_u32(value: usize) -> Result<u32> {
    u32::try_from(value).map_err(|_| PartSegError::Image(format!("dimension {value} too large for TIFF")))
}
