//! GeoTIFF scene input and flux output.
//!
//! Scenes are single-image, pixel-interleaved (chunky) multi-band TIFFs.
//! Georeferencing travels as the raw GeoTIFF tags, which are carried from the
//! input to the output untouched.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use ndarray::{Array3, ArrayView3};
use tiff::decoder::{ifd::Value, Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::ColorType;
use tiff::encoder::{TiffEncoder, TiffValue};
use tiff::tags::{PhotometricInterpretation, PlanarConfiguration, SampleFormat, Tag};

use crate::error::{Result, RetrievalError};

/// Bands of an output raster.
pub const OUTPUT_BANDS: usize = 10;

const MODEL_PIXEL_SCALE: u16 = 33550;
const MODEL_TIEPOINT: u16 = 33922;
const MODEL_TRANSFORMATION: u16 = 34264;
const GEO_KEY_DIRECTORY: u16 = 34735;
const GEO_DOUBLE_PARAMS: u16 = 34736;
const GEO_ASCII_PARAMS: u16 = 34737;
const GDAL_NODATA: u16 = 42113;

/// Raw value of one GeoTIFF tag.
#[derive(Debug, Clone, PartialEq)]
pub enum GeoTagValue {
    Doubles(Vec<f64>),
    Shorts(Vec<u16>),
    Ascii(String),
}

/// GeoTIFF tags of a scene, keyed by tag number.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoTags {
    entries: Vec<(u16, GeoTagValue)>,
}

impl GeoTags {
    pub fn insert(&mut self, tag: u16, value: GeoTagValue) {
        self.entries.retain(|(t, _)| *t != tag);
        self.entries.push((tag, value));
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Decoded scene: `(bands, rows, cols)` samples as f32.
#[derive(Debug, Clone)]
pub struct Raster {
    pub bands: Array3<f32>,
    pub geo: GeoTags,
}

/// Read every band of a chunky multi-band TIFF.
pub fn read_raster(path: &Path) -> Result<Raster> {
    let err = |e: tiff::TiffError| RetrievalError::raster(path, e);

    let file = File::open(path)?;
    let mut decoder = Decoder::new(BufReader::new(file)).map_err(err)?.with_limits(Limits::unlimited());

    let (width, height) = decoder.dimensions().map_err(err)?;
    let samples = decoder
        .find_tag_unsigned::<u16>(Tag::SamplesPerPixel)
        .map_err(err)?
        .unwrap_or(1) as usize;
    let planar = decoder
        .find_tag_unsigned::<u16>(Tag::PlanarConfiguration)
        .map_err(err)?
        .unwrap_or(1);
    if planar == PlanarConfiguration::Planar.to_u16() {
        return Err(RetrievalError::raster(path, "planar TIFF layout is not supported"));
    }

    let geo = read_geo_tags(&mut decoder).map_err(err)?;

    let data: Vec<f32> = match decoder.read_image().map_err(err)? {
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::I8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::I32(v) => v.into_iter().map(|x| x as f32).collect(),
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|x| x as f32).collect(),
        _ => return Err(RetrievalError::raster(path, "unsupported sample format")),
    };

    let (rows, cols) = (height as usize, width as usize);
    let interleaved = Array3::from_shape_vec((rows, cols, samples), data)
        .map_err(|e| RetrievalError::raster(path, e))?;
    let bands = interleaved.permuted_axes([2, 0, 1]).as_standard_layout().into_owned();

    Ok(Raster { bands, geo })
}

fn read_geo_tags<R: std::io::Read + std::io::Seek>(decoder: &mut Decoder<R>) -> tiff::TiffResult<GeoTags> {
    let mut geo = GeoTags::default();
    for code in [
        MODEL_PIXEL_SCALE,
        MODEL_TIEPOINT,
        MODEL_TRANSFORMATION,
        GEO_DOUBLE_PARAMS,
    ] {
        if let Some(v) = decoder.find_tag(Tag::from_u16_exhaustive(code))? {
            geo.insert(code, GeoTagValue::Doubles(v.into_f64_vec()?));
        }
    }
    if let Some(v) = decoder.find_tag(Tag::from_u16_exhaustive(GEO_KEY_DIRECTORY))? {
        geo.insert(GEO_KEY_DIRECTORY, GeoTagValue::Shorts(v.into_u16_vec()?));
    }
    if let Some(Value::Ascii(s)) = decoder.find_tag(Tag::from_u16_exhaustive(GEO_ASCII_PARAMS))? {
        geo.insert(GEO_ASCII_PARAMS, GeoTagValue::Ascii(s));
    }
    Ok(geo)
}

/// Ten signed 16-bit samples per pixel.
struct FluxBands;

impl ColorType for FluxBands {
    type Inner = i16;
    const TIFF_VALUE: PhotometricInterpretation = PhotometricInterpretation::BlackIsZero;
    const BITS_PER_SAMPLE: &'static [u16] = &[16; OUTPUT_BANDS];
    const SAMPLE_FORMAT: &'static [SampleFormat] = &[SampleFormat::Int; OUTPUT_BANDS];

    fn horizontal_predict(row: &[i16], result: &mut Vec<i16>) {
        let sample_size = Self::SAMPLE_FORMAT.len();
        if row.len() < sample_size {
            return;
        }
        let (start, rest) = row.split_at(sample_size);
        result.extend_from_slice(start);
        result.extend(row.iter().zip(rest).map(|(prev, current)| current.wrapping_sub(*prev)));
    }
}

/// Write `(bands, rows, cols)` samples as an interleaved TIFF of colour type `C`.
pub(crate) fn write_tiff<C>(
    path: &Path,
    bands: ArrayView3<C::Inner>,
    geo: &GeoTags,
    nodata: Option<&str>,
) -> Result<()>
where
    C: ColorType,
    C::Inner: Copy,
    [C::Inner]: TiffValue,
{
    let err = |e: tiff::TiffError| RetrievalError::raster(path, e);

    let (n_bands, rows, cols) = bands.dim();
    if n_bands != C::BITS_PER_SAMPLE.len() {
        return Err(RetrievalError::raster(
            path,
            format!("{n_bands} bands for a {}-sample colour type", C::BITS_PER_SAMPLE.len()),
        ));
    }
    let interleaved: Vec<C::Inner> = bands.permuted_axes([1, 2, 0]).iter().copied().collect();

    let file = BufWriter::new(File::create(path)?);
    let mut tiff = TiffEncoder::new(file).map_err(err)?;
    let mut image = tiff.new_image::<C>(cols as u32, rows as u32).map_err(err)?;

    let dir = image.encoder();
    for (code, value) in &geo.entries {
        let tag = Tag::from_u16_exhaustive(*code);
        match value {
            GeoTagValue::Doubles(v) => dir.write_tag(tag, &v[..]),
            GeoTagValue::Shorts(v) => dir.write_tag(tag, &v[..]),
            GeoTagValue::Ascii(s) => dir.write_tag(tag, s.as_str()),
        }
        .map_err(err)?;
    }
    if let Some(nodata) = nodata {
        dir.write_tag(Tag::from_u16_exhaustive(GDAL_NODATA), nodata).map_err(err)?;
    }

    image.write_data(&interleaved).map_err(err)
}

/// Write the ten scaled flux bands with nodata `-1`.
pub fn write_output(path: &Path, bands: &Array3<i16>, geo: &GeoTags) -> Result<()> {
    write_tiff::<FluxBands>(path, bands.view(), geo, Some("-1"))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Float scene layout used by test fixtures.
    pub(crate) struct SceneBands;

    impl ColorType for SceneBands {
        type Inner = f32;
        const TIFF_VALUE: PhotometricInterpretation = PhotometricInterpretation::BlackIsZero;
        const BITS_PER_SAMPLE: &'static [u16] = &[32; crate::scene::INPUT_BANDS];
        const SAMPLE_FORMAT: &'static [SampleFormat] = &[SampleFormat::IEEEFP; crate::scene::INPUT_BANDS];

        fn horizontal_predict(_: &[f32], _: &mut Vec<f32>) {
            unreachable!()
        }
    }

    pub(crate) fn sample_geo() -> GeoTags {
        let mut geo = GeoTags::default();
        geo.insert(MODEL_PIXEL_SCALE, GeoTagValue::Doubles(vec![0.01, 0.01, 0.0]));
        geo.insert(
            MODEL_TIEPOINT,
            GeoTagValue::Doubles(vec![0.0, 0.0, 0.0, 100.0, 40.0, 0.0]),
        );
        geo.insert(
            GEO_KEY_DIRECTORY,
            GeoTagValue::Shorts(vec![1, 1, 0, 2, 1024, 0, 1, 2, 2048, 0, 1, 4326]),
        );
        geo.insert(GEO_ASCII_PARAMS, GeoTagValue::Ascii("WGS 84|".into()));
        geo
    }

    #[test]
    fn test_output_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.tif");
        let bands = Array3::from_shape_fn((OUTPUT_BANDS, 3, 4), |(b, r, c)| {
            (b as i16) * 100 - (r as i16) * 10 + c as i16 - 1
        });
        let geo = sample_geo();
        write_output(&path, &bands, &geo).unwrap();

        let raster = read_raster(&path).unwrap();
        assert_eq!(raster.bands.dim(), (OUTPUT_BANDS, 3, 4));
        assert_eq!(raster.bands[[0, 0, 0]], -1.0);
        assert_eq!(raster.bands[[9, 2, 3]], 900.0 - 20.0 + 2.0);
        assert_eq!(raster.geo, geo);
    }

    #[test]
    fn test_input_bands_deinterleaved() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scene.tif");
        let n = crate::scene::INPUT_BANDS;
        let bands = Array3::from_shape_fn((n, 2, 2), |(b, r, c)| (b * 4 + r * 2 + c) as f32);
        write_tiff::<SceneBands>(&path, bands.view(), &GeoTags::default(), None).unwrap();

        let raster = read_raster(&path).unwrap();
        assert_eq!(raster.bands, bands);
        assert!(raster.geo.is_empty());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = read_raster(&dir.path().join("absent.tif")).unwrap_err();
        assert!(matches!(err, RetrievalError::Io(_)));
    }

    #[test]
    fn test_band_count_mismatch() {
        let dir = TempDir::new().unwrap();
        let bands = Array3::<i16>::zeros((3, 2, 2));
        let err = write_output(&dir.path().join("x.tif"), &bands, &GeoTags::default());
        assert!(err.is_err());
    }
}
