//! Pin maps for the boards this tool knows about.

use clap::ValueEnum;

use crate::pin::PinAssignment;

/// Which transport carries the pin operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    /// GPIO header of the host itself (Raspberry Pi)
    Local,
    /// USB bridge microcontroller
    Bridge,
}

/// Board variant wired to the programmer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum Profile {
    /// Standard wiring for the selected backend
    #[default]
    Default,
    Bonbon,
    Keks,
    Eis,
}

const LOCAL_DEFAULT: PinAssignment = PinAssignment {
    cs: 25,
    mosi: 9,
    miso: 10,
    sck: 11,
    reset: 23,
    done: 24,
};

const BRIDGE_DEFAULT: PinAssignment = PinAssignment {
    cs: 9,
    mosi: 8,
    miso: 11,
    sck: 10,
    reset: 3,
    done: 2,
};

impl Profile {
    pub fn pins(self, backend: BackendKind) -> PinAssignment {
        let base = match backend {
            BackendKind::Local => LOCAL_DEFAULT,
            BackendKind::Bridge => BRIDGE_DEFAULT,
        };

        match self {
            Profile::Default => base,
            Profile::Bonbon => PinAssignment {
                cs: 29,
                mosi: 28,
                miso: 27,
                sck: 26,
                done: 18,
                reset: 19,
            },
            Profile::Keks => PinAssignment {
                cs: 25,
                mosi: 24,
                miso: 27,
                sck: 26,
                done: 22,
                reset: 23,
            },
            Profile::Eis => PinAssignment {
                cs: 22,
                mosi: 24,
                miso: 27,
                sck: 26,
                done: 3,
                reset: 2,
            },
        }
    }

    /// Boards whose bridge firmware takes the pins back itself once we are done.
    pub fn hands_off(self) -> bool {
        matches!(self, Profile::Bonbon | Profile::Keks)
    }
}

/// Route the SPI lines to the Werkzeug PMOD for flashing an attached module.
///
/// RESET and DONE keep their board assignment.
pub fn werkzeug(pins: PinAssignment) -> PinAssignment {
    PinAssignment {
        cs: 19,
        mosi: 17,
        miso: 15,
        sck: 13,
        ..pins
    }
}
