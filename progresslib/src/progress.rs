mod format;

use format::{BinarySize, ClockDuration, Eta};

use std::{
    fmt,
    io::Write,
    time::{Duration, Instant},
};

use crossterm::{
    cursor::{Hide, MoveToColumn, Show},
    QueueableCommand,
    Result,
    style::{Print, Stylize},
    terminal::{self, Clear, ClearType},
    tty::IsTty,
};

/// What the transfer is currently doing. Shown as a label in front of the bar.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Queued,
    Downloading,
    /// Waiting for the connection to come back before retrying
    Waiting,
    Paused,
    Verifying,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Queued => "Queued",
            Self::Downloading => "Downloading",
            Self::Waiting => "Waiting",
            Self::Paused => "Paused",
            Self::Verifying => "Verifying",
        })
    }
}

/// How the progress bar should be drawn
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressDrawMode {
    /// Overwrite the same line on every frame. The default frame rate in this
    /// mode is 15 fps.
    Interactive,
    /// Append a new line on every frame, for when output is redirected. The
    /// default frame rate in this mode is 0.2 fps.
    Append,
    /// Do not draw to the terminal.
    None,
}

impl ProgressDrawMode {
    fn default_fps(self) -> f64 {
        match self {
            Self::Interactive => 15.0,
            Self::Append => 0.2,
            Self::None => 0.0,
        }
    }

    fn detect<T: IsTty>(term: &T) -> Self {
        if term.is_tty() {
            Self::Interactive
        } else {
            Self::Append
        }
    }
}

/// Progress bar for a single artifact transfer. Unlike a self-timing bar, the
/// position and ETA are pushed in from the outside, since the transfer engine
/// already computes a smoothed estimate.
pub struct TransferBar<T: Write + IsTty> {
    total: u64,
    pos: u64,
    eta_secs: Option<u64>,
    phase: Phase,
    term: T,
    mode: ProgressDrawMode,
    /// (Maximum) frames per second for rendering
    fps: f64,
    last_draw: Option<Instant>,
    started: Instant,
}

impl<T: Write + IsTty> TransferBar<T> {
    pub fn new(term: T, total: u64) -> Self {
        let mode = ProgressDrawMode::detect(&term);

        Self {
            total,
            pos: 0,
            eta_secs: None,
            phase: Phase::Queued,
            term,
            mode,
            fps: mode.default_fps(),
            last_draw: None,
            started: Instant::now(),
        }
    }

    pub fn mode(&self) -> ProgressDrawMode {
        self.mode
    }

    /// Set the draw mode or pick one based on the terminal if [`None`]. This
    /// resets the fps to the default for the mode.
    pub fn set_mode(&mut self, mode: Option<ProgressDrawMode>) {
        self.mode = mode.unwrap_or_else(|| ProgressDrawMode::detect(&self.term));
        self.fps = self.mode.default_fps();
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn set_fps(&mut self, fps: f64) {
        self.fps = fps;
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Update the byte count and ETA. The redraw is rate limited.
    pub fn update(&mut self, pos: u64, total: u64, eta_secs: Option<u64>) -> Result<()> {
        self.pos = pos;
        self.total = total;
        self.eta_secs = eta_secs;
        self.draw(false)
    }

    /// Switch to a new phase. This performs an immediate redraw.
    pub fn set_phase(&mut self, phase: Phase) -> Result<()> {
        self.phase = phase;
        if phase == Phase::Verifying {
            self.eta_secs = None;
        }
        self.draw(true)
    }

    /// Print a line without clobbering the progress bar itself.
    pub fn println<I: Into<String>>(&mut self, msg: I) -> Result<()> {
        if self.mode == ProgressDrawMode::None {
            return Ok(());
        }

        if self.mode == ProgressDrawMode::Interactive {
            self.term
                .queue(Clear(ClearType::CurrentLine))?
                .queue(MoveToColumn(0))?;
        }

        self.term
            .queue(Print(msg.into()))?
            .queue(Print('\n'))?;

        if self.mode == ProgressDrawMode::Interactive {
            self.draw(true)?;
        } else {
            self.term.flush()?;
        }

        Ok(())
    }

    /// Clear the bar from an interactive terminal or draw the final line in
    /// append mode. Called automatically on drop.
    pub fn finish(&mut self) -> Result<()> {
        match self.mode {
            ProgressDrawMode::Interactive => {
                self.term
                    .queue(Clear(ClearType::CurrentLine))?
                    .queue(MoveToColumn(0))?
                    .queue(Show)?
                    .flush()?;
            }
            ProgressDrawMode::Append => self.draw(true)?,
            ProgressDrawMode::None => {}
        }
        Ok(())
    }

    /// Keep the current frame on screen by moving to a new line.
    pub fn keep(&mut self) -> Result<()> {
        if self.mode == ProgressDrawMode::Interactive {
            self.term
                .queue(Print('\n'))?
                .flush()?;
        }
        Ok(())
    }

    fn render(&self) -> (String, f64) {
        let (ratio, percent) = if self.total == 0 {
            (0.0, 0)
        } else {
            let pos = self.pos.min(self.total);
            // Never round up to 100% before the transfer is really done
            (pos as f64 / self.total as f64, pos as u128 * 100 / self.total as u128)
        };

        let line = format!(
            "[{elapsed}] {phase} {bar_placeholder}{percent}% {pos}/{total} (ETA {eta})",
            elapsed = ClockDuration(self.started.elapsed()),
            phase = self.phase,
            bar_placeholder = if self.mode == ProgressDrawMode::Interactive {
                "\x00"
            } else {
                ""
            },
            pos = BinarySize(self.pos),
            total = BinarySize(self.total),
            eta = Eta(self.eta_secs),
        );

        (line, ratio)
    }

    /// Draw the bar. Unless `force` is true, this is subject to the fps limit.
    pub fn draw(&mut self, force: bool) -> Result<()> {
        if self.mode == ProgressDrawMode::None {
            return Ok(());
        }

        if !force && self.fps > 0.0 {
            let frame_dur = Duration::from_secs_f64(1.0 / self.fps);
            if self.last_draw.map_or(false, |t| t.elapsed() < frame_dur) {
                return Ok(());
            }
        }

        let (mut line, ratio) = self.render();

        if self.mode == ProgressDrawMode::Interactive {
            let term_width = terminal::size().unwrap_or((80, 24)).0 as usize;
            // The placeholder counts towards the length, which accounts for
            // the space after the bar
            let bar_width = term_width.saturating_sub(line.len());
            let bar_consumed = (ratio * bar_width as f64).round() as usize;
            let bar_remaining = bar_width.saturating_sub(bar_consumed);

            line = if bar_width != 0 {
                line.replace('\x00', &format!(
                    "{}{} ",
                    "#".repeat(bar_consumed).cyan(),
                    "-".repeat(bar_remaining).blue(),
                ))
            } else {
                line.replace('\x00', "")
            };

            self.term
                .queue(Hide)?
                .queue(Clear(ClearType::CurrentLine))?
                .queue(MoveToColumn(0))?;
        } else {
            line.push('\n');
        }

        self.term
            .queue(Print(line))?
            .flush()?;

        self.last_draw = Some(Instant::now());

        Ok(())
    }
}

impl<T: Write + IsTty> Drop for TransferBar<T> {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        cell::RefCell,
        io::{self, Error, ErrorKind},
        rc::Rc,
        str,
    };

    use super::*;

    struct TestTerm {
        buf: Rc<RefCell<String>>,
        tty: bool,
    }

    impl TestTerm {
        fn new(tty: bool) -> Self {
            Self {
                buf: Rc::new(RefCell::new(String::new())),
                tty,
            }
        }
    }

    impl Write for TestTerm {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let s = str::from_utf8(buf)
                .map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
            self.buf.borrow_mut().push_str(s);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl IsTty for TestTerm {
        fn is_tty(&self) -> bool {
            self.tty
        }
    }

    fn take(buf: &Rc<RefCell<String>>) -> String {
        std::mem::take(&mut *buf.borrow_mut())
    }

    #[test]
    fn test_no_output() {
        let term = TestTerm::new(false);
        let buf = term.buf.clone();
        let mut bar = TransferBar::new(term, 10);

        bar.set_mode(Some(ProgressDrawMode::None));
        assert_eq!(bar.fps(), 0.0);

        bar.update(5, 10, Some(3)).unwrap();
        assert_eq!(bar.position(), 5);
        bar.set_phase(Phase::Verifying).unwrap();
        bar.println("hello").unwrap();
        drop(bar);

        assert_eq!(take(&buf), "");
    }

    #[test]
    fn test_append() {
        let term = TestTerm::new(false);
        let buf = term.buf.clone();
        let mut bar = TransferBar::new(term, 10);

        assert_eq!(bar.mode(), ProgressDrawMode::Append);
        assert_eq!(bar.fps(), 0.2);
        bar.set_fps(0.0);

        bar.set_phase(Phase::Downloading).unwrap();
        take(&buf);

        bar.update(1, 10, None).unwrap();
        let output = take(&buf);
        let pieces: Vec<&str> = output.trim_end().split(' ').collect();
        assert_eq!(pieces[1], "Downloading");
        assert_eq!(pieces[2], "10%");
        assert_eq!(pieces[3], "1B/10B");
        assert_eq!(pieces[5], "unknown)");

        // 99.9% is not rounded up
        bar.update(999, 1000, Some(61)).unwrap();
        let output = take(&buf);
        let pieces: Vec<&str> = output.trim_end().split(' ').collect();
        assert_eq!(pieces[2], "99%");
        assert_eq!(pieces[5], "1m1s)");

        bar.keep().unwrap();
        assert_eq!(take(&buf), "");

        bar.println("hello").unwrap();
        assert_eq!(take(&buf), "hello\n");

        bar.set_phase(Phase::Verifying).unwrap();
        let output = take(&buf);
        assert!(output.contains(" Verifying "));
        assert!(output.ends_with("(ETA unknown)\n"));

        // The final state is kept in the log
        drop(bar);
        assert!(take(&buf).ends_with('\n'));
    }

    #[test]
    fn test_rate_limit() {
        let term = TestTerm::new(false);
        let buf = term.buf.clone();
        let mut bar = TransferBar::new(term, 10);
        bar.set_fps(0.001);

        bar.update(1, 10, None).unwrap();
        assert!(!take(&buf).is_empty());

        bar.update(2, 10, None).unwrap();
        assert_eq!(take(&buf), "");

        // Phase changes always show up
        bar.set_phase(Phase::Paused).unwrap();
        assert!(take(&buf).contains(" Paused 20% "));
    }

    #[test]
    fn test_interactive() {
        let term = TestTerm::new(true);
        let buf = term.buf.clone();
        let mut bar = TransferBar::new(term, 10);

        assert_eq!(bar.mode(), ProgressDrawMode::Interactive);
        assert_eq!(bar.fps(), 15.0);
        bar.set_fps(0.0);

        bar.update(10, 10, Some(0)).unwrap();
        {
            let output = take(&buf);
            let pieces: Vec<&str> = output.split(' ').collect();
            assert!(pieces[1].ends_with("Queued"));
            assert!(pieces[2].starts_with('\u{1b}'));
            assert_eq!(pieces[3], "100%");
            assert_eq!(pieces[4], "10B/10B");
        }

        bar.keep().unwrap();
        assert!(take(&buf).ends_with('\n'));

        bar.println("hello").unwrap();
        {
            let output = take(&buf);
            let lines: Vec<&str> = output.lines().collect();
            assert!(lines[0].ends_with("hello"));
            assert!(lines[1].contains("100%"));
        }

        drop(bar);
        assert!(!take(&buf).contains('#'));
    }
}
