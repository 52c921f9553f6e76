//! MySQL Binlog 이벤트 디코딩
//!
//! 각 이벤트:
//!   - Timestamp (4 bytes)
//!   - Type (1 byte)
//!   - Server ID (4 bytes)
//!   - Event Length (4 bytes)
//!   - Next Position (4 bytes)
//!   - Flags (2 bytes)
//!   - Event Data (variable)
//!
//! 체크섬은 연결 시 비활성화하므로 이벤트 끝에 CRC32가 붙지 않습니다.
//! 행 내용은 해석하지 않고, 테이블 맵의 컬럼 타입으로 행 이미지 경계만 찾아
//! 영향받은 행 수를 셉니다.

use crate::error::{Result, WatchError};
use crate::events::{tags, EventCategory, RawEvent};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use tracing::warn;

pub const EVENT_HEADER_SIZE: usize = 19;

/// Binlog 이벤트 타입 코드
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinlogEventType {
    Query,
    Rotate,
    FormatDescription,
    Xid,
    TableMap,
    WriteRowsV1,
    UpdateRowsV1,
    DeleteRowsV1,
    Heartbeat,
    WriteRows,
    UpdateRows,
    DeleteRows,
    Gtid,
    AnonymousGtid,
    PreviousGtids,
    RowsQuery,
    Unknown(u8),
}

impl BinlogEventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => BinlogEventType::Query,
            4 => BinlogEventType::Rotate,
            15 => BinlogEventType::FormatDescription,
            16 => BinlogEventType::Xid,
            19 => BinlogEventType::TableMap,
            23 => BinlogEventType::WriteRowsV1,
            24 => BinlogEventType::UpdateRowsV1,
            25 => BinlogEventType::DeleteRowsV1,
            27 => BinlogEventType::Heartbeat,
            30 => BinlogEventType::WriteRows,
            31 => BinlogEventType::UpdateRows,
            32 => BinlogEventType::DeleteRows,
            33 => BinlogEventType::Gtid,
            34 => BinlogEventType::AnonymousGtid,
            35 => BinlogEventType::PreviousGtids,
            29 => BinlogEventType::RowsQuery,
            other => BinlogEventType::Unknown(other),
        }
    }

    /// 원시 이벤트 타입 태그 (v1/v2 행 이벤트는 같은 태그)
    pub fn type_name(&self) -> &'static str {
        match self {
            BinlogEventType::Query => "Query",
            BinlogEventType::Rotate => "Rotate",
            BinlogEventType::FormatDescription => "Format",
            BinlogEventType::Xid => "Xid",
            BinlogEventType::TableMap => tags::TABLE_MAP,
            BinlogEventType::WriteRowsV1 | BinlogEventType::WriteRows => tags::WRITE_ROWS,
            BinlogEventType::UpdateRowsV1 | BinlogEventType::UpdateRows => tags::UPDATE_ROWS,
            BinlogEventType::DeleteRowsV1 | BinlogEventType::DeleteRows => tags::DELETE_ROWS,
            BinlogEventType::Heartbeat => "Heartbeat",
            BinlogEventType::Gtid => "Gtid",
            BinlogEventType::AnonymousGtid => "AnonymousGtid",
            BinlogEventType::PreviousGtids => "PreviousGtids",
            BinlogEventType::RowsQuery => "RowsQuery",
            BinlogEventType::Unknown(_) => "Unknown",
        }
    }

    /// 구독 가능한 범주 (그 외 이벤트는 소스 밖으로 나가지 않음)
    pub fn category(&self) -> Option<EventCategory> {
        match self {
            BinlogEventType::TableMap => Some(EventCategory::TableMap),
            BinlogEventType::WriteRowsV1 | BinlogEventType::WriteRows => {
                Some(EventCategory::WriteRows)
            }
            BinlogEventType::UpdateRowsV1 | BinlogEventType::UpdateRows => {
                Some(EventCategory::UpdateRows)
            }
            BinlogEventType::DeleteRowsV1 | BinlogEventType::DeleteRows => {
                Some(EventCategory::DeleteRows)
            }
            _ => None,
        }
    }

    fn is_rows_v2(&self) -> bool {
        matches!(
            self,
            BinlogEventType::WriteRows | BinlogEventType::UpdateRows | BinlogEventType::DeleteRows
        )
    }

    fn is_update(&self) -> bool {
        matches!(
            self,
            BinlogEventType::UpdateRowsV1 | BinlogEventType::UpdateRows
        )
    }
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventHeader {
    pub timestamp: u32,
    pub event_type: BinlogEventType,
    pub server_id: u32,
    pub event_length: u32,
    pub next_pos: u32,
    pub flags: u16,
}

impl EventHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < EVENT_HEADER_SIZE {
            return Err(WatchError::BinlogParseError(format!(
                "Event header too short: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        Ok(EventHeader {
            timestamp: cursor.read_u32::<LittleEndian>()?,
            event_type: BinlogEventType::from_u8(cursor.read_u8()?),
            server_id: cursor.read_u32::<LittleEndian>()?,
            event_length: cursor.read_u32::<LittleEndian>()?,
            next_pos: cursor.read_u32::<LittleEndian>()?,
            flags: cursor.read_u16::<LittleEndian>()?,
        })
    }
}

/// MySQL 컬럼 타입 코드
pub mod column_type {
    pub const DECIMAL: u8 = 0;
    pub const TINY: u8 = 1;
    pub const SHORT: u8 = 2;
    pub const LONG: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const NULL: u8 = 6;
    pub const TIMESTAMP: u8 = 7;
    pub const LONGLONG: u8 = 8;
    pub const INT24: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const DATETIME: u8 = 12;
    pub const YEAR: u8 = 13;
    pub const NEWDATE: u8 = 14;
    pub const VARCHAR: u8 = 15;
    pub const BIT: u8 = 16;
    pub const TIMESTAMP2: u8 = 17;
    pub const DATETIME2: u8 = 18;
    pub const TIME2: u8 = 19;
    pub const JSON: u8 = 245;
    pub const NEWDECIMAL: u8 = 246;
    pub const ENUM: u8 = 247;
    pub const SET: u8 = 248;
    pub const TINY_BLOB: u8 = 249;
    pub const MEDIUM_BLOB: u8 = 250;
    pub const LONG_BLOB: u8 = 251;
    pub const BLOB: u8 = 252;
    pub const VAR_STRING: u8 = 253;
    pub const STRING: u8 = 254;
    pub const GEOMETRY: u8 = 255;
}

/// 테이블 맵 이벤트에서 읽은 테이블 구조
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    pub table_id: u64,
    pub schema: String,
    pub table: String,
    pub column_types: Vec<u8>,
    /// 해석할 수 없는 컬럼 타입이 있으면 `None` (행 수를 셀 수 없음)
    pub column_meta: Option<Vec<u16>>,
}

impl TableLayout {
    /// TABLE_MAP 이벤트 본문 파싱 (19)
    pub fn parse(body: &[u8]) -> Result<Self> {
        Self::parse_inner(body)
            .map_err(|e| WatchError::BinlogParseError(format!("Invalid table map event: {}", e)))
    }

    fn parse_inner(body: &[u8]) -> io::Result<Self> {
        let mut cursor = Cursor::new(body);

        let table_id = cursor.read_u48::<LittleEndian>()?;
        let _flags = cursor.read_u16::<LittleEndian>()?;

        let schema = read_short_string(&mut cursor)?;
        cursor.read_u8()?; // null terminator
        let table = read_short_string(&mut cursor)?;
        cursor.read_u8()?;

        let column_count = read_packed_int(&mut cursor)? as usize;
        let mut column_types = vec![0u8; column_count];
        cursor.read_exact(&mut column_types)?;

        let metadata_len = read_packed_int(&mut cursor)?;
        let metadata_end = cursor.position() + metadata_len;
        let parsed = column_types
            .iter()
            .map(|t| read_column_meta(&mut cursor, *t))
            .collect::<io::Result<Vec<u16>>>();
        let column_meta = parsed.ok().filter(|_| cursor.position() == metadata_end);
        if column_meta.is_none() {
            warn!(
                "Column metadata of {}.{} not understood (types {:?}), row counts unavailable",
                schema, table, column_types
            );
        }

        Ok(TableLayout {
            table_id,
            schema,
            table,
            column_types,
            column_meta,
        })
    }
}

/// 행 이벤트 본문에서 테이블 ID만 읽기
pub fn rows_table_id(body: &[u8]) -> Result<u64> {
    Cursor::new(body)
        .read_u48::<LittleEndian>()
        .map_err(|e| WatchError::BinlogParseError(format!("Invalid rows event: {}", e)))
}

/// 행 이벤트의 행 수 계산 (UPDATE는 변경 전/후 한 쌍을 한 행으로 셈)
pub fn count_rows(body: &[u8], event_type: BinlogEventType, layout: &TableLayout) -> Result<usize> {
    count_rows_inner(body, event_type, layout)
        .map_err(|e| WatchError::BinlogParseError(format!("Invalid rows event: {}", e)))
}

fn count_rows_inner(body: &[u8], event_type: BinlogEventType, layout: &TableLayout) -> io::Result<usize> {
    let mut cursor = Cursor::new(body);

    let _table_id = cursor.read_u48::<LittleEndian>()?;
    let _flags = cursor.read_u16::<LittleEndian>()?;

    if event_type.is_rows_v2() {
        // extra data 길이는 자기 자신 2 바이트 포함
        let extra_len = cursor.read_u16::<LittleEndian>()?;
        skip(&mut cursor, u64::from(extra_len.saturating_sub(2)))?;
    }

    let column_meta = layout.column_meta.as_deref().ok_or_else(|| {
        io::Error::new(io::ErrorKind::Unsupported, "column metadata not understood")
    })?;

    let column_count = read_packed_int(&mut cursor)? as usize;
    if column_count > layout.column_types.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "rows event has {} columns but table map has {}",
                column_count,
                layout.column_types.len()
            ),
        ));
    }

    let bitmap_len = column_count.div_ceil(8);
    let mut before_columns = vec![0u8; bitmap_len];
    cursor.read_exact(&mut before_columns)?;
    let after_columns = if event_type.is_update() {
        let mut bitmap = vec![0u8; bitmap_len];
        cursor.read_exact(&mut bitmap)?;
        Some(bitmap)
    } else {
        None
    };

    let mut rows = 0;
    while (cursor.position() as usize) < body.len() {
        skip_row_image(&mut cursor, layout, column_meta, column_count, &before_columns)?;
        if let Some(after) = &after_columns {
            skip_row_image(&mut cursor, layout, column_meta, column_count, after)?;
        }
        rows += 1;
    }

    Ok(rows)
}

fn skip_row_image(
    cursor: &mut Cursor<&[u8]>,
    layout: &TableLayout,
    column_meta: &[u16],
    column_count: usize,
    present: &[u8],
) -> io::Result<()> {
    let present_count: usize = present.iter().map(|b| b.count_ones() as usize).sum();
    let mut nulls = vec![0u8; present_count.div_ceil(8)];
    cursor.read_exact(&mut nulls)?;

    let mut null_idx = 0;
    for col in 0..column_count {
        if !is_bit_set(present, col) {
            continue;
        }
        let is_null = is_bit_set(&nulls, null_idx);
        null_idx += 1;
        if is_null {
            continue;
        }

        let len = value_len(cursor, layout.column_types[col], column_meta[col])?;
        skip(cursor, len as u64)?;
    }

    Ok(())
}

/// 컬럼 값 길이 (길이 접두사가 있으면 읽고 남은 본문 길이를 반환)
fn value_len(cursor: &mut Cursor<&[u8]>, col_type: u8, meta: u16) -> io::Result<usize> {
    use column_type::*;

    let fsp_len = |meta: u16| (meta as usize + 1) / 2;

    let len = match col_type {
        NULL => 0,
        TINY | YEAR => 1,
        SHORT => 2,
        INT24 | DATE | NEWDATE | TIME => 3,
        LONG | FLOAT | TIMESTAMP => 4,
        LONGLONG | DOUBLE | DATETIME => 8,
        TIMESTAMP2 => 4 + fsp_len(meta),
        DATETIME2 => 5 + fsp_len(meta),
        TIME2 => 3 + fsp_len(meta),
        VARCHAR | VAR_STRING => read_length_prefix(cursor, if meta < 256 { 1 } else { 2 })?,
        BIT => {
            let bits = (meta >> 8) as usize * 8 + (meta & 0xff) as usize;
            bits.div_ceil(8)
        }
        NEWDECIMAL => decimal_bin_size((meta >> 8) as usize, (meta & 0xff) as usize),
        ENUM | SET => (meta & 0xff) as usize,
        TINY_BLOB | MEDIUM_BLOB | LONG_BLOB | BLOB | GEOMETRY | JSON => {
            read_length_prefix(cursor, meta as usize)?
        }
        STRING => {
            let (real_type, max_len) = string_meta(meta);
            match real_type {
                ENUM | SET => max_len,
                _ => read_length_prefix(cursor, if max_len < 256 { 1 } else { 2 })?,
            }
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("unsupported column type {}", other),
            ))
        }
    };

    Ok(len)
}

/// STRING 컬럼 메타데이터에서 실제 타입과 최대 길이 추출
///
/// 최대 길이가 255를 넘으면 상위 비트가 타입 바이트에 섞여 있음
fn string_meta(meta: u16) -> (u8, usize) {
    let high = (meta >> 8) as u8;
    let low = (meta & 0xff) as usize;
    if meta < 256 {
        return (column_type::STRING, meta as usize);
    }
    if high & 0x30 != 0x30 {
        let max_len = low | ((((high & 0x30) ^ 0x30) as usize) << 4);
        (high | 0x30, max_len)
    } else {
        (high, low)
    }
}

fn decimal_bin_size(precision: usize, scale: usize) -> usize {
    const DIG_TO_BYTES: [usize; 10] = [0, 1, 1, 2, 2, 3, 3, 4, 4, 4];
    let integral = precision.saturating_sub(scale);
    (integral / 9) * 4 + DIG_TO_BYTES[integral % 9] + (scale / 9) * 4 + DIG_TO_BYTES[scale % 9]
}

fn read_column_meta(cursor: &mut Cursor<&[u8]>, col_type: u8) -> io::Result<u16> {
    use column_type::*;

    Ok(match col_type {
        FLOAT | DOUBLE | TINY_BLOB | MEDIUM_BLOB | LONG_BLOB | BLOB | GEOMETRY | JSON => {
            cursor.read_u8()? as u16
        }
        TIMESTAMP2 | DATETIME2 | TIME2 => cursor.read_u8()? as u16,
        BIT | VARCHAR | VAR_STRING => cursor.read_u16::<LittleEndian>()?,
        // precision, scale 순서
        NEWDECIMAL | STRING | ENUM | SET => cursor.read_u16::<BigEndian>()?,
        _ => 0,
    })
}

fn read_length_prefix(cursor: &mut Cursor<&[u8]>, bytes: usize) -> io::Result<usize> {
    let len = match bytes {
        1 => cursor.read_u8()? as usize,
        2 => cursor.read_u16::<LittleEndian>()? as usize,
        3 => cursor.read_u24::<LittleEndian>()? as usize,
        4 => cursor.read_u32::<LittleEndian>()? as usize,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid length prefix size {}", other),
            ))
        }
    };
    Ok(len)
}

/// Length-encoded integer
fn read_packed_int(cursor: &mut Cursor<&[u8]>) -> io::Result<u64> {
    match cursor.read_u8()? {
        byte @ 0..=0xfa => Ok(byte as u64),
        0xfc => Ok(cursor.read_u16::<LittleEndian>()? as u64),
        0xfd => Ok(cursor.read_u24::<LittleEndian>()? as u64),
        0xfe => cursor.read_u64::<LittleEndian>(),
        byte => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("invalid packed integer prefix 0x{:02x}", byte),
        )),
    }
}

fn read_short_string(cursor: &mut Cursor<&[u8]>) -> io::Result<String> {
    let len = cursor.read_u8()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).to_string())
}

fn skip(cursor: &mut Cursor<&[u8]>, len: u64) -> io::Result<()> {
    let next = cursor.position() + len;
    if next > cursor.get_ref().len() as u64 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "value extends past end of event",
        ));
    }
    cursor.set_position(next);
    Ok(())
}

fn is_bit_set(bitmap: &[u8], idx: usize) -> bool {
    bitmap
        .get(idx / 8)
        .is_some_and(|byte| byte & (1 << (idx % 8)) != 0)
}

/// 이벤트 바이트열을 `RawEvent`로 변환
///
/// 행 수를 세려면 컬럼 구조가 필요하므로 테이블 맵은 구독 여부와 관계없이
/// 항상 기억합니다.
#[derive(Debug, Default)]
pub struct BinlogDecoder {
    layouts: HashMap<u64, TableLayout>,
}

impl BinlogDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 이벤트 하나 디코딩. 구독 가능한 범주가 아니면 범주는 `None`
    pub fn decode(&mut self, data: &[u8]) -> Result<(Option<EventCategory>, RawEvent)> {
        let header = EventHeader::parse(data)?;
        let body = &data[EVENT_HEADER_SIZE..];
        let event_type = header.event_type;
        let category = event_type.category();

        let event = match category {
            Some(EventCategory::TableMap) => {
                let layout = TableLayout::parse(body)?;
                let event = RawEvent::table_map(
                    header.timestamp,
                    layout.table_id,
                    layout.schema.clone(),
                    layout.table.clone(),
                );
                self.layouts.insert(layout.table_id, layout);
                event
            }
            Some(_) => {
                let table_id = rows_table_id(body)?;
                let row_count = match self.layouts.get(&table_id) {
                    Some(layout) => match count_rows(body, event_type, layout) {
                        Ok(count) => count,
                        Err(e) => {
                            warn!(
                                "Cannot count rows of {}.{} (table_id={}): {}",
                                layout.schema, layout.table, table_id, e
                            );
                            0
                        }
                    },
                    None => {
                        warn!(
                            "No column layout for table_id={}, row count unknown",
                            table_id
                        );
                        0
                    }
                };
                RawEvent::rows(event_type.type_name(), header.timestamp, table_id, row_count)
            }
            None => RawEvent::other(event_type.type_name(), header.timestamp),
        };

        Ok((category, event))
    }

    pub fn layout(&self, table_id: u64) -> Option<&TableLayout> {
        self.layouts.get(&table_id)
    }
}
