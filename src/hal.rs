//! Hardware abstraction contract the rest of the crate is generic over.
//!
//! Mirrors the method set of the original firmware's `EspHal` (pin mode,
//! digital I/O, interrupt attach/detach, timing, SPI transfer), generalized
//! to a trait rather than one concrete MCU HAL so this crate can be driven
//! by `stm32-hal2`, any `embedded-hal` implementation, or an in-memory mock
//! in tests.

/// Everything the link layer needs from the board: the SX1262's four
/// control lines, coarse timing, and a blocking full-duplex SPI transfer.
///
/// `spi_transfer` performs the transaction with NSS already asserted by the
/// implementor (datasheet commands are single SPI transactions; this crate
/// never needs to interleave transfers under one chip-select assertion).
pub trait Hal {
    /// Drive the radio's NRESET line.
    fn set_reset(&mut self, high: bool);

    /// Read the BUSY line. `true` while the chip is processing a command.
    fn read_busy(&mut self) -> bool;

    /// Read the DIO1 line directly (used for polling fallback and tests;
    /// the primary signal path is the DIO1 edge interrupt).
    fn read_dio1(&mut self) -> bool;

    /// Enable the DIO1 rising-edge interrupt that drives [`crate::driver::Dio1Signal`].
    fn enable_dio1_interrupt(&mut self);

    /// Disable the DIO1 interrupt (used while the driver is crashed).
    fn disable_dio1_interrupt(&mut self);

    /// Full-duplex SPI exchange, NSS asserted for the duration of the call.
    /// `buf` holds the outgoing bytes on entry and the incoming bytes on
    /// return, matching the command/response framing of every SX1262
    /// opcode.
    fn spi_transfer(&mut self, buf: &mut [u8]) -> Result<(), ()>;

    /// Busy-wait. Used for the microsecond-scale delays the datasheet's
    /// command sequencing calls for.
    fn delay_us(&mut self, us: u32);

    /// Task-level sleep, used for the driver's retry backoff.
    fn delay_ms(&mut self, ms: u32);

    /// Monotonic microsecond clock, used for time-on-air deadlines and the
    /// ack timer.
    fn micros(&mut self) -> u32;
}

/// Generic [`Hal`] built from `embedded-hal` 1.0 pin/SPI/delay traits, in
/// the same generic-over-concrete-pin-types style as `ask433`'s
/// `AskDriver<TX, RX, PTT>`. `embedded-hal` has no interrupt-attach or
/// monotonic-clock trait, so those two concerns are plain `fn` pointers the
/// board-support crate supplies — a bare function, not a closure, since
/// nothing here needs to capture state beyond what's already a field.
pub struct EmbeddedHalBoard<RESET, BUSY, DIO1, SPI, DELAY> {
    reset: RESET,
    busy: BUSY,
    dio1: DIO1,
    spi: SPI,
    delay: DELAY,
    set_dio1_interrupt: fn(bool),
    now_us: fn() -> u32,
}

impl<RESET, BUSY, DIO1, SPI, DELAY> EmbeddedHalBoard<RESET, BUSY, DIO1, SPI, DELAY> {
    pub fn new(
        reset: RESET,
        busy: BUSY,
        dio1: DIO1,
        spi: SPI,
        delay: DELAY,
        set_dio1_interrupt: fn(bool),
        now_us: fn() -> u32,
    ) -> Self {
        Self {
            reset,
            busy,
            dio1,
            spi,
            delay,
            set_dio1_interrupt,
            now_us,
        }
    }
}

impl<RESET, BUSY, DIO1, SPI, DELAY> Hal for EmbeddedHalBoard<RESET, BUSY, DIO1, SPI, DELAY>
where
    RESET: embedded_hal::digital::OutputPin,
    BUSY: embedded_hal::digital::InputPin,
    DIO1: embedded_hal::digital::InputPin,
    SPI: embedded_hal::spi::SpiDevice,
    DELAY: embedded_hal::delay::DelayNs,
{
    fn set_reset(&mut self, high: bool) {
        let _ = if high {
            self.reset.set_high()
        } else {
            self.reset.set_low()
        };
    }

    fn read_busy(&mut self) -> bool {
        self.busy.is_high().unwrap_or(true)
    }

    fn read_dio1(&mut self) -> bool {
        self.dio1.is_high().unwrap_or(false)
    }

    fn enable_dio1_interrupt(&mut self) {
        (self.set_dio1_interrupt)(true);
    }

    fn disable_dio1_interrupt(&mut self) {
        (self.set_dio1_interrupt)(false);
    }

    fn spi_transfer(&mut self, buf: &mut [u8]) -> Result<(), ()> {
        self.spi.transfer_in_place(buf).map_err(|_| ())
    }

    fn delay_us(&mut self, us: u32) {
        self.delay.delay_us(us);
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay.delay_ms(ms);
    }

    fn micros(&mut self) -> u32 {
        (self.now_us)()
    }
}
