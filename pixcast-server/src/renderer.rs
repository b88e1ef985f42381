//! Test-pattern renderer.
//!
//! Runs on a dedicated OS thread and feeds the frame queue at a fixed
//! pace. Each frame is `[palette id | width * height pixel indices]`:
//!
//! ```text
//!   renderer thread                        tokio runtime
//!  ┌───────────────┐  acquire/submit   ┌─────────────────┐
//!  │ TestPattern   │ ────────────────▶ │ FrameQueue pump │
//!  │  draw()       │                   └─────────────────┘
//!  │  apply(input) │ ◀──── try_recv ─── input channel
//!  └───────────────┘
//! ```
//!
//! A full queue means the network side is behind; the frame is skipped
//! rather than waited for.

use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use pixcast_core::{Buttons, FrameProducer, InputEvent};

/// Number of palettes the viewer knows about.
pub const PALETTE_COUNT: u8 = 4;

const CURSOR_SIZE: usize = 8;
const CURSOR_STEP: i32 = 4;
const CURSOR_COLOR: u8 = 0xFF;
const CURSOR_PRESSED_COLOR: u8 = 0x0F;

const KEY_SPACE: u8 = 32;
const KEY_LEFT: u8 = 37;
const KEY_UP: u8 = 38;
const KEY_RIGHT: u8 = 39;
const KEY_DOWN: u8 = 40;

// ── Pattern ──────────────────────────────────────────────────────

/// Scrolling diagonal bands with an input-driven cursor.
#[derive(Debug, Clone)]
pub struct TestPattern {
    width: usize,
    height: usize,
    tick: u32,
    palette: u8,
    cursor: (i32, i32),
    buttons: Buttons,
}

impl TestPattern {
    pub fn new(width: usize, height: usize) -> Self {
        Self {
            width,
            height,
            tick: 0,
            palette: 0,
            cursor: ((width / 2) as i32, (height / 2) as i32),
            buttons: Buttons::empty(),
        }
    }

    pub fn palette(&self) -> u8 {
        self.palette
    }

    pub fn cursor(&self) -> (i32, i32) {
        self.cursor
    }

    /// Bytes per frame including the palette byte.
    pub fn frame_len(&self) -> usize {
        1 + self.width * self.height
    }

    pub fn apply(&mut self, event: InputEvent) {
        match event {
            InputEvent::KeyDown(KEY_SPACE) => {
                self.palette = (self.palette + 1) % PALETTE_COUNT;
            }
            InputEvent::KeyDown(KEY_LEFT) => self.nudge(-CURSOR_STEP, 0),
            InputEvent::KeyDown(KEY_RIGHT) => self.nudge(CURSOR_STEP, 0),
            InputEvent::KeyDown(KEY_UP) => self.nudge(0, -CURSOR_STEP),
            InputEvent::KeyDown(KEY_DOWN) => self.nudge(0, CURSOR_STEP),
            InputEvent::KeyDown(_) | InputEvent::KeyUp(_) => {}
            InputEvent::MouseMove { dx, dy } => self.nudge(dx.into(), dy.into()),
            InputEvent::MouseButtons(buttons) => self.buttons = buttons,
            InputEvent::Joystick { buttons, dx, dy } => {
                self.buttons = buttons;
                self.nudge(dx.into(), dy.into());
            }
        }
    }

    fn nudge(&mut self, dx: i32, dy: i32) {
        let max_x = self.width.saturating_sub(1) as i32;
        let max_y = self.height.saturating_sub(1) as i32;
        self.cursor.0 = (self.cursor.0 + dx).clamp(0, max_x);
        self.cursor.1 = (self.cursor.1 + dy).clamp(0, max_y);
    }

    /// Render the next frame into `frame` and advance the animation.
    /// `frame` must be `frame_len()` bytes.
    pub fn draw(&mut self, frame: &mut [u8]) {
        let Some((palette, pixels)) = frame.split_first_mut() else {
            return;
        };
        *palette = self.palette;

        let shift = self.tick as usize;
        for (y, row) in pixels.chunks_exact_mut(self.width.max(1)).enumerate() {
            for (x, px) in row.iter_mut().enumerate() {
                *px = ((x + y + shift) / 4) as u8;
            }
        }

        let color = if self.buttons.contains(Buttons::PRIMARY) {
            CURSOR_PRESSED_COLOR
        } else {
            CURSOR_COLOR
        };
        let (cx, cy) = (self.cursor.0 as usize, self.cursor.1 as usize);
        for y in cy..(cy + CURSOR_SIZE).min(self.height) {
            let row = y * self.width;
            for x in cx..(cx + CURSOR_SIZE).min(self.width) {
                pixels[row + x] = color;
            }
        }

        self.tick = self.tick.wrapping_add(1);
    }
}

// ── Thread ───────────────────────────────────────────────────────

/// Counters reported when the renderer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub rendered: u64,
    /// Ticks skipped because the queue was full.
    pub skipped: u64,
}

/// Render one tick. Returns `false` when the queue had no free slot.
pub fn render_once(pattern: &mut TestPattern, producer: &mut FrameProducer) -> bool {
    let Some(mut slot) = producer.acquire_write_slot() else {
        return false;
    };
    pattern.draw(&mut slot);
    drop(slot);
    producer.submit()
}

/// Spawn the renderer on its own OS thread.
pub fn spawn(
    mut producer: FrameProducer,
    mut pattern: TestPattern,
    mut input: Option<mpsc::Receiver<InputEvent>>,
    interval: Duration,
    cancel: CancellationToken,
) -> std::io::Result<thread::JoinHandle<RenderStats>> {
    thread::Builder::new()
        .name("pixcast-renderer".into())
        .spawn(move || {
            info!(?interval, "renderer started");
            let mut stats = RenderStats::default();
            let mut next = Instant::now();

            while !cancel.is_cancelled() {
                if let Some(rx) = input.as_mut() {
                    while let Ok(event) = rx.try_recv() {
                        pattern.apply(event);
                    }
                }

                if render_once(&mut pattern, &mut producer) {
                    stats.rendered += 1;
                } else {
                    stats.skipped += 1;
                    debug!("frame queue full, skipping tick");
                }

                next += interval;
                let now = Instant::now();
                if next > now {
                    thread::sleep(next - now);
                } else {
                    // Fell behind; don't try to catch up.
                    next = now;
                }
            }

            info!(rendered = stats.rendered, skipped = stats.skipped, "renderer stopped");
            stats
        })
}

// ── Tests ────────────────────────────────────────────────────────
