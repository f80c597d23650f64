use esp_idf_svc::hal::gpio::{AnyOutputPin, Output, Pin, PinDriver};
use esp_idf_svc::sys::EspError;
use log::info;

use crate::led_bank::{LedError, LedPin};

// GPIO output driving one LED; state is read back from the output latch
pub struct GpioLed {
    pin: PinDriver<'static, AnyOutputPin, Output>,
}

impl GpioLed {
    pub fn new(pin: AnyOutputPin) -> Result<Self, EspError> {
        let gpio = pin.pin();
        let driver = PinDriver::output(pin)?;
        info!("💡 LED output ready on GPIO{}", gpio);
        Ok(Self { pin: driver })
    }
}

impl LedPin for GpioLed {
    fn set(&mut self, on: bool) -> Result<(), LedError> {
        let result = if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        result.map_err(|e| LedError::Gpio(e.to_string()))
    }

    fn is_on(&self) -> bool {
        self.pin.is_set_high()
    }
}
