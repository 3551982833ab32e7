//! Radio configuration: board pinouts and the standard parameter sets.
//!
//! Value types built by pure functions, in the same style as the teacher's
//! `RadioConfig6x`/`Default` pair, but sourced from the original firmware's
//! `getStandardConfig`/`getRadioPins` tables rather than the datasheet
//! defaults the teacher ships.

/// Carrier board the radio sits on. Each has its own TCXO voltage and
/// high-power PA trim.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum BoardType {
    EbyteSx1262,
    WioSx1262,
}

/// Coarse output-power preset requested by the application.
#[derive(Clone, Copy, PartialEq, Eq)]
pub enum PowerMode {
    Low,
    High,
}

/// Radio link parameters. Immutable once built; `standard_config` is the
/// only constructor so every deployed radio on the link agrees on the
/// fixed defaults.
#[derive(Clone)]
pub struct RadioConfig {
    pub freq_mhz: f32,
    pub bw_khz: f32,
    pub spreading_factor: u8,
    pub coding_rate: u8,
    pub sync_word: u8,
    pub preamble_length: u16,
    pub tcxo_voltage: f32,
    pub pa_duty: u8,
    pub hp_max: u8,
    pub power_dbm: i8,
}

/// Board pin assignments. `const fn` tables, not runtime-discovered, since
/// each board variant wires the radio identically across units.
#[derive(Clone, Copy)]
pub struct Pinout {
    pub sclk: u8,
    pub miso: u8,
    pub mosi: u8,
    pub nss: u8,
    pub nrst: u8,
    pub dio1: u8,
    pub busy: u8,
}

/// Fixed pinout shared by both board types.
pub const fn standard_pinout() -> Pinout {
    Pinout {
        sclk: 25,
        miso: 26,
        mosi: 27,
        nss: 14,
        nrst: 13,
        dio1: 34,
        busy: 35,
    }
}

/// Build the configuration for a board/power-mode pair. Matches the
/// original firmware's `getStandardConfig` field-for-field, including the
/// high-power Ebyte branch's double assignment of `pa_duty`/`hp_max` — only
/// the final pair survives there, so it's encoded directly rather than
/// reproduced as two sequential writes.
pub fn standard_config(board: BoardType, mode: PowerMode) -> RadioConfig {
    let tcxo_voltage = match board {
        BoardType::EbyteSx1262 => 1.8,
        BoardType::WioSx1262 => 2.2,
    };

    let (pa_duty, hp_max, power_dbm) = match (board, mode) {
        (_, PowerMode::Low) => (2, 2, 8),
        (BoardType::EbyteSx1262, PowerMode::High) => (2, 3, 22),
        (BoardType::WioSx1262, PowerMode::High) => (4, 7, 22),
    };

    RadioConfig {
        freq_mhz: 915.0,
        bw_khz: 250.0,
        spreading_factor: 7,
        coding_rate: 7,
        sync_word: 0x18,
        preamble_length: 8,
        tcxo_voltage,
        pa_duty,
        hp_max,
        power_dbm,
    }
}
