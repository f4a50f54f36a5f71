//! Value encoding for persisted entries.
//!
//! A record nests ids under tiles under relev/score pairs, all in descending order, so
//! decoding yields grid values in descending numeric order without a sort:
//!
//! ```text
//! PhraseRecord -> [RelevScore { relev_score: u8, coords: [Coord { coord: u32, ids: [u32] }] }]
//! ```
//!
//! Vectors are a little-endian u32 length followed by their items; nested vectors are
//! referenced by u32 offsets. The root record sits at the very end of the buffer.

use std::convert::TryInto;
use std::marker::PhantomData;

use failure::Error;
use itertools::Itertools;

use crate::gridcache::common::*;
use crate::gridcache::error::*;

#[derive(Debug, Clone, Copy)]
pub struct Offset(usize);

pub trait EncodableWrite {
    fn write_to(&self, buffer: &mut Vec<u8>);
}

pub trait EncodableRead<'a>: Sized {
    const SIZE: usize;
    fn read_from(buffer: &'a [u8], offset: Offset) -> Result<Self, Error>;
}

fn corrupt() -> Error {
    io_error("corrupt grid record")
}

#[inline]
fn read_u32(buffer: &[u8], offset: usize) -> Result<u32, Error> {
    let bytes = buffer.get(offset..offset + 4).ok_or_else(corrupt)?;
    Ok(u32::from_le_bytes(bytes.try_into()?))
}

pub struct Writer {
    data: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { data: Vec::new() }
    }

    pub fn write_scalar<T: EncodableWrite>(&mut self, s: T) -> Offset {
        let loc = self.data.len();
        s.write_to(&mut self.data);
        Offset(loc)
    }

    pub fn write_vec<T: EncodableWrite>(&mut self, s: &[T]) -> Offset {
        let loc = self.data.len();
        self.data.extend_from_slice(&(s.len() as u32).to_le_bytes());
        for item in s {
            item.write_to(&mut self.data);
        }
        Offset(loc)
    }

    pub fn finish(self) -> Vec<u8> {
        self.data
    }
}

pub struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data }
    }

    pub fn read_root<T: EncodableRead<'a>>(&self) -> Result<T, Error> {
        if self.data.len() < T::SIZE {
            return Err(corrupt());
        }
        T::read_from(self.data, Offset(self.data.len() - T::SIZE))
    }
}

pub struct EncodedVec<'a, T> {
    data: &'a [u8],
    start: usize,
    len: usize,
    phantom: PhantomData<&'a T>,
}

impl<'a, T: EncodableRead<'a>> EncodedVec<'a, T> {
    pub fn new(data: &'a [u8], offset: Offset) -> Result<Self, Error> {
        let len = read_u32(data, offset.0)? as usize;
        let start = offset.0 + 4;
        let end = len.checked_mul(T::SIZE).and_then(|size| size.checked_add(start));
        match end {
            Some(end) if end <= data.len() => {
                Ok(EncodedVec { data, start, len, phantom: PhantomData })
            }
            _ => Err(corrupt()),
        }
    }

    pub fn from_pointer(data: &'a [u8], offset: Offset) -> Result<Self, Error> {
        let ptr = read_u32(data, offset.0)?;
        Self::new(data, Offset(ptr as usize))
    }

    pub fn get(&self, pos: usize) -> Result<T, Error> {
        T::read_from(self.data, Offset(self.start + (pos * T::SIZE)))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<T, Error>> + '_ {
        (0..self.len).map(move |idx| self.get(idx))
    }
}

pub struct RelevScore<V> {
    relev_score: u8,
    coords: V,
}

impl EncodableWrite for RelevScore<Offset> {
    fn write_to(&self, buffer: &mut Vec<u8>) {
        buffer.push(self.relev_score);
        buffer.extend_from_slice(&(self.coords.0 as u32).to_le_bytes());
    }
}

impl<'a> EncodableRead<'a> for RelevScore<EncodedVec<'a, Coord<EncodedVec<'a, u32>>>> {
    const SIZE: usize = 5;
    fn read_from(buffer: &'a [u8], offset: Offset) -> Result<Self, Error> {
        let relev_score = *buffer.get(offset.0).ok_or_else(corrupt)?;
        let coords = EncodedVec::from_pointer(buffer, Offset(offset.0 + 1))?;
        Ok(RelevScore { relev_score, coords })
    }
}

pub struct Coord<V> {
    coord: u32,
    ids: V,
}

impl EncodableWrite for Coord<Offset> {
    fn write_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.coord.to_le_bytes());
        buffer.extend_from_slice(&(self.ids.0 as u32).to_le_bytes());
    }
}

impl<'a> EncodableRead<'a> for Coord<EncodedVec<'a, u32>> {
    const SIZE: usize = 8;
    fn read_from(buffer: &'a [u8], offset: Offset) -> Result<Self, Error> {
        let coord = read_u32(buffer, offset.0)?;
        let ids = EncodedVec::<'a, u32>::from_pointer(buffer, Offset(offset.0 + 4))?;
        Ok(Coord { coord, ids })
    }
}

impl EncodableWrite for u32 {
    fn write_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&self.to_le_bytes());
    }
}

impl<'a> EncodableRead<'a> for u32 {
    const SIZE: usize = 4;
    fn read_from(buffer: &'a [u8], offset: Offset) -> Result<Self, Error> {
        read_u32(buffer, offset.0)
    }
}

pub struct PhraseRecord<V> {
    relev_scores: V,
}

type RecordView<'a> =
    PhraseRecord<EncodedVec<'a, RelevScore<EncodedVec<'a, Coord<EncodedVec<'a, u32>>>>>>;

impl EncodableWrite for PhraseRecord<Offset> {
    fn write_to(&self, buffer: &mut Vec<u8>) {
        buffer.extend_from_slice(&(self.relev_scores.0 as u32).to_le_bytes());
    }
}

impl<'a> EncodableRead<'a> for RecordView<'a> {
    const SIZE: usize = 4;
    fn read_from(buffer: &'a [u8], offset: Offset) -> Result<Self, Error> {
        let relev_scores = EncodedVec::from_pointer(buffer, offset)?;
        Ok(PhraseRecord { relev_scores })
    }
}

const COORD_FIELD_MASK: u64 = (1 << (2 * COORD_BITS)) - 1;
const ID_FIELD_MASK: u64 = (1 << ID_BITS) - 1;

/// Serializes packed grid values; input order and duplicates don't matter.
pub fn encode_grids(values: &[u64]) -> Vec<u8> {
    let mut grids = values.to_vec();
    sort_grids(&mut grids);

    let mut writer = Writer::new();
    let mut rses = Vec::new();
    for (relev_score, rs_group) in &grids.iter().group_by(|value| (**value >> SCORE_SHIFT) as u8) {
        let mut coords = Vec::new();
        for (coord, coord_group) in
            &rs_group.group_by(|value| ((**value >> X_SHIFT) & COORD_FIELD_MASK) as u32)
        {
            let ids: Vec<u32> = coord_group.map(|value| (*value & ID_FIELD_MASK) as u32).collect();
            let w_ids = writer.write_vec(&ids);
            coords.push(Coord { coord, ids: w_ids });
        }
        let w_coords = writer.write_vec(&coords);
        rses.push(RelevScore { relev_score, coords: w_coords });
    }
    let w_rses = writer.write_vec(&rses);

    writer.write_scalar(PhraseRecord { relev_scores: w_rses });
    writer.finish()
}

/// Reads back the values written by `encode_grids`, in descending order.
pub fn decode_grids(data: &[u8]) -> Result<Vec<u64>, Error> {
    let reader = Reader::new(data);
    let record: RecordView = reader.read_root()?;

    let mut out = Vec::new();
    for rs in record.relev_scores.iter() {
        let rs = rs?;
        let rs_bits = (rs.relev_score as u64) << SCORE_SHIFT;
        for coord in rs.coords.iter() {
            let coord = coord?;
            let coord_bits = (coord.coord as u64) << X_SHIFT;
            out.reserve(coord.ids.len());
            for id in coord.ids.iter() {
                out.push(rs_bits | coord_bits | id? as u64);
            }
        }
    }
    Ok(out)
}
