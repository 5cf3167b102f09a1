//! The periodic side effect performed by the control loop on every tick.

/// Something the control loop invokes once per tick.
pub trait Beeper: Send {
    fn beep(&mut self);
}

impl<F> Beeper for F
where
    F: FnMut() + Send,
{
    fn beep(&mut self) {
        self()
    }
}

/// Plays the default system sound.
///
/// Uses `MessageBeep` on Windows. Elsewhere the terminal bell is rung by writing a BEL byte to
/// stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBeep;

impl Beeper for SystemBeep {
    #[cfg(windows)]
    fn beep(&mut self) {
        use windows_sys::Win32::System::Diagnostics::Debug::MessageBeep;

        // 0xFFFFFFFF is the simple beep, it does not depend on the sound scheme.
        if unsafe { MessageBeep(0xFFFF_FFFF) } == 0 {
            log::debug!("MessageBeep failed: {}", std::io::Error::last_os_error());
        }
    }

    #[cfg(not(windows))]
    fn beep(&mut self) {
        use std::io::Write;

        let mut stdout = std::io::stdout();
        if let Err(e) = stdout.write_all(b"\x07").and_then(|()| stdout.flush()) {
            log::debug!("Unable to ring the terminal bell: {}", e);
        }
    }
}
