//! blob/codec - кодирование записей и сканирование региона.
//!
//! Форматы (BE):
//!   страница: [key_len u16][value_len u32][key][value]
//!   журнал:   [name_len u16][key_len u16][value_len u32][name][key][value]
//!
//! Сканирование - чистая функция над `&[u8]`: возвращает найденные записи и
//! то, чем закончился проход (`ScanEnd`). Обнуление повреждённого хвоста делает
//! вызывающий код (см. `ScanEnd::Repaired`), поэтому путь починки тестируется
//! отдельно от mmap.

use byteorder::{BigEndian, ByteOrder};

use crate::consts::{
    HEADER_SIZE, RECOVERY_HEADER_SIZE, REC_OFF_KEY_LEN, REC_OFF_VALUE_LEN, RREC_OFF_KEY_LEN,
    RREC_OFF_NAME_LEN, RREC_OFF_VALUE_LEN,
};

/// Чем закончился проход по региону.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanEnd {
    /// key_len == 0 и дальше одни нули (или ровно граница ёмкости): хвост = offset.
    Sentinel(usize),
    /// Битый заголовок/хвост: с `from` регион нужно обнулить, хвост = from.
    Repaired { from: usize },
}

impl ScanEnd {
    /// Позиция хвоста (nextWritePosition) после скана.
    #[inline]
    pub fn tail(&self) -> usize {
        match *self {
            ScanEnd::Sentinel(off) => off,
            ScanEnd::Repaired { from } => from,
        }
    }
}

/// Запись страницы, найденная сканером.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRecord {
    pub offset: usize,
    pub size: usize,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Запись recovery-журнала, найденная сканером.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalRecord {
    pub offset: usize,
    pub size: usize,
    pub file_name: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scan<R> {
    pub records: Vec<R>,
    pub end: ScanEnd,
}

#[inline]
pub fn page_record_size(key_len: usize, value_len: usize) -> usize {
    HEADER_SIZE + key_len + value_len
}

#[inline]
pub fn journal_record_size(name_len: usize, key_len: usize, value_len: usize) -> usize {
    RECOVERY_HEADER_SIZE + name_len + key_len + value_len
}

/// Конец живых данных на `pos`: за хвостом допустимы только нули.
/// Остатки недообнулённой компакции уходят в починку.
fn tail_end(buf: &[u8], pos: usize) -> ScanEnd {
    if buf[pos..].iter().all(|&b| b == 0) {
        ScanEnd::Sentinel(pos)
    } else {
        ScanEnd::Repaired { from: pos }
    }
}

/// Просканировать одну страницу с offset 0.
pub fn scan_page(buf: &[u8]) -> Scan<PageRecord> {
    let cap = buf.len();
    let mut records = Vec::new();
    let mut pos = 0usize;

    let end = loop {
        if pos == cap {
            break ScanEnd::Sentinel(pos);
        }
        if cap - pos < HEADER_SIZE {
            break tail_end(buf, pos);
        }
        let key_len = BigEndian::read_u16(&buf[pos + REC_OFF_KEY_LEN..pos + REC_OFF_KEY_LEN + 2]) as usize;
        if key_len == 0 {
            break tail_end(buf, pos);
        }
        let value_len =
            BigEndian::read_u32(&buf[pos + REC_OFF_VALUE_LEN..pos + REC_OFF_VALUE_LEN + 4]) as usize;
        let size = page_record_size(key_len, value_len);
        let end = match pos.checked_add(size) {
            Some(e) if e <= cap => e,
            _ => break ScanEnd::Repaired { from: pos },
        };
        let key_start = pos + HEADER_SIZE;
        let value_start = key_start + key_len;
        records.push(PageRecord {
            offset: pos,
            size,
            key: buf[key_start..value_start].to_vec(),
            value: buf[value_start..end].to_vec(),
        });
        pos = end;
    };

    Scan { records, end }
}

/// Просканировать регион журнала с offset 0.
///
/// Имя файла-владельца читается для каждой записи, даже чужой, чтобы
/// смещения следующих записей оставались верными.
pub fn scan_journal(buf: &[u8]) -> Scan<JournalRecord> {
    let cap = buf.len();
    let mut records = Vec::new();
    let mut pos = 0usize;

    let end = loop {
        if pos == cap {
            break ScanEnd::Sentinel(pos);
        }
        if cap - pos < RECOVERY_HEADER_SIZE {
            break tail_end(buf, pos);
        }
        let name_len =
            BigEndian::read_u16(&buf[pos + RREC_OFF_NAME_LEN..pos + RREC_OFF_NAME_LEN + 2]) as usize;
        let key_len =
            BigEndian::read_u16(&buf[pos + RREC_OFF_KEY_LEN..pos + RREC_OFF_KEY_LEN + 2]) as usize;
        if name_len == 0 || key_len == 0 {
            // Пустое имя/ключ не пишутся никогда: это конец живых данных.
            if name_len == 0 && key_len == 0 {
                break tail_end(buf, pos);
            }
            break ScanEnd::Repaired { from: pos };
        }
        let value_len =
            BigEndian::read_u32(&buf[pos + RREC_OFF_VALUE_LEN..pos + RREC_OFF_VALUE_LEN + 4]) as usize;
        let size = journal_record_size(name_len, key_len, value_len);
        let end = match pos.checked_add(size) {
            Some(e) if e <= cap => e,
            _ => break ScanEnd::Repaired { from: pos },
        };
        let name_start = pos + RECOVERY_HEADER_SIZE;
        let key_start = name_start + name_len;
        let value_start = key_start + key_len;
        let file_name = match std::str::from_utf8(&buf[name_start..key_start]) {
            Ok(s) => s.to_string(),
            Err(_) => break ScanEnd::Repaired { from: pos },
        };
        records.push(JournalRecord {
            offset: pos,
            size,
            file_name,
            key: buf[key_start..value_start].to_vec(),
            value: buf[value_start..end].to_vec(),
        });
        pos = end;
    };

    Scan { records, end }
}

/// Записать запись страницы по смещению `off`. Возвращает размер записи.
pub fn write_page_record(buf: &mut [u8], off: usize, key: &[u8], value: &[u8]) -> usize {
    let size = page_record_size(key.len(), value.len());
    BigEndian::write_u16(&mut buf[off + REC_OFF_KEY_LEN..off + REC_OFF_KEY_LEN + 2], key.len() as u16);
    BigEndian::write_u32(
        &mut buf[off + REC_OFF_VALUE_LEN..off + REC_OFF_VALUE_LEN + 4],
        value.len() as u32,
    );
    let key_start = off + HEADER_SIZE;
    buf[key_start..key_start + key.len()].copy_from_slice(key);
    buf[key_start + key.len()..off + size].copy_from_slice(value);
    size
}

/// Записать запись журнала по смещению `off`. Возвращает размер записи.
pub fn write_journal_record(
    buf: &mut [u8],
    off: usize,
    file_name: &str,
    key: &[u8],
    value: &[u8],
) -> usize {
    let name = file_name.as_bytes();
    let size = journal_record_size(name.len(), key.len(), value.len());
    BigEndian::write_u16(&mut buf[off + RREC_OFF_NAME_LEN..off + RREC_OFF_NAME_LEN + 2], name.len() as u16);
    BigEndian::write_u16(&mut buf[off + RREC_OFF_KEY_LEN..off + RREC_OFF_KEY_LEN + 2], key.len() as u16);
    BigEndian::write_u32(
        &mut buf[off + RREC_OFF_VALUE_LEN..off + RREC_OFF_VALUE_LEN + 4],
        value.len() as u32,
    );
    let mut p = off + RECOVERY_HEADER_SIZE;
    buf[p..p + name.len()].copy_from_slice(name);
    p += name.len();
    buf[p..p + key.len()].copy_from_slice(key);
    p += key.len();
    buf[p..p + value.len()].copy_from_slice(value);
    size
}

/// Компакция: сдвинуть байты после `[offset, offset+size)` влево до `tail`
/// и обнулить освободившийся хвост. Возвращает новый хвост.
pub fn compact(buf: &mut [u8], offset: usize, size: usize, tail: usize) -> usize {
    debug_assert!(offset + size <= tail && tail <= buf.len());
    buf.copy_within(offset + size..tail, offset);
    buf[tail - size..tail].fill(0);
    tail - size
}
