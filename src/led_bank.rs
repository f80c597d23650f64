// LED Bank Module
// Four GPIO-backed LEDs addressed by id 1..=4

use log::info;

pub const LED_COUNT: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedError {
    InvalidId(i64),
    Gpio(String),
}

impl std::fmt::Display for LedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedError::InvalidId(id) => write!(f, "Invalid LED id {} (expected 1-{})", id, LED_COUNT),
            LedError::Gpio(msg) => write!(f, "GPIO error: {}", msg),
        }
    }
}

impl std::error::Error for LedError {}

/// One output line driving an LED
pub trait LedPin: Send {
    fn set(&mut self, on: bool) -> Result<(), LedError>;
    fn is_on(&self) -> bool;
}

/// Validated 1-based LED id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedId(u8);

impl LedId {
    pub fn new(id: i64) -> Result<Self, LedError> {
        if (1..=LED_COUNT as i64).contains(&id) {
            Ok(Self(id as u8))
        } else {
            Err(LedError::InvalidId(id))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedState {
    On,
    Off,
}

impl LedState {
    pub fn from_level(on: bool) -> Self {
        if on {
            LedState::On
        } else {
            LedState::Off
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LedState::On => "on",
            LedState::Off => "off",
        }
    }

    pub fn toggled(self) -> Self {
        match self {
            LedState::On => LedState::Off,
            LedState::Off => LedState::On,
        }
    }

    fn is_on(self) -> bool {
        self == LedState::On
    }
}

pub struct LedBank<P: LedPin> {
    pins: [P; LED_COUNT],
}

impl<P: LedPin> LedBank<P> {
    /// Takes ownership of the pins and switches every LED off
    pub fn new(mut pins: [P; LED_COUNT]) -> Result<Self, LedError> {
        for pin in pins.iter_mut() {
            pin.set(false)?;
        }
        info!("💡 LED bank ready ({} LEDs off)", LED_COUNT);
        Ok(Self { pins })
    }

    pub fn get(&self, id: LedId) -> LedState {
        LedState::from_level(self.pins[id.index()].is_on())
    }

    /// Flip one LED and return its new state
    pub fn toggle(&mut self, id: LedId) -> Result<LedState, LedError> {
        let next = self.get(id).toggled();
        self.pins[id.index()].set(next.is_on())?;
        info!("💡 LED {} -> {}", id.get(), next.as_str());
        Ok(next)
    }
}
