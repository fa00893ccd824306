//! Общие константы форматов (pages, recovery journal, файлы).

// -------- Pages --------
/// Ёмкость одной страницы (байт). Файл всегда кратен этому размеру.
pub const BUFFER_CAPACITY: usize = 1024 * 1024;
/// Жёсткий потолок числа страниц на логический файл.
pub const MAX_PAGES: usize = 64;

// Формат записи страницы (BE, как у исходного mmap-формата):
// [key_len u16][value_len u32][key][value]
// Total header size = 2 + 4 = 6 bytes.
pub const HEADER_SIZE: usize = 6;
pub const REC_OFF_KEY_LEN: usize = 0;
pub const REC_OFF_VALUE_LEN: usize = 2;

// -------- Recovery journal --------
/// Ёмкость общего recovery-журнала (один регион, без роста).
pub const RECOVERY_CAPACITY: usize = 1024 * 1024;

// Формат записи журнала:
// [file_name_len u16][key_len u16][value_len u32][file_name][key][value]
// Total header size = 2 + 2 + 4 = 8 bytes.
pub const RECOVERY_HEADER_SIZE: usize = 8;
pub const RREC_OFF_NAME_LEN: usize = 0;
pub const RREC_OFF_KEY_LEN: usize = 2;
pub const RREC_OFF_VALUE_LEN: usize = 4;

// -------- Files --------
pub const STORE_FILE_EXT: &str = "bin";
pub const RECOVERY_FILE: &str = "safebox_recovery.bin";
