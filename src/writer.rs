use noto_sans_mono_bitmap::{get_raster, FontWeight, RasterHeight, RasterizedChar};
use spin::Mutex;
use lazy_static::lazy_static;

// --- CONFIGURATION ---
const LINE_SPACING: usize = 2;
const LETTER_SPACING: usize = 0;
const BORDER_PADDING: usize = 10;
const GLYPH_HEIGHT: usize = 16;
const BACKGROUND: u32 = 0x00101820;

// --- THE CONSOLE ---
/// Text console drawn straight into the Limine framebuffer.
pub struct Writer {
    video_ptr: *mut u32,
    width: usize,
    height: usize,
    pitch: usize,
    cursor_x: usize,
    cursor_y: usize,
}

// SAFETY: the framebuffer is only touched through the WRITER mutex.
unsafe impl Send for Writer {}

lazy_static! {
    pub static ref WRITER: Mutex<Option<Writer>> = Mutex::new(None);
}

impl Writer {
    /// Installs the console. `pitch` is in pixels, not bytes.
    pub fn init(video_ptr: *mut u32, width: usize, height: usize, pitch: usize) {
        let mut console = Writer {
            video_ptr,
            width,
            height,
            pitch,
            cursor_x: BORDER_PADDING,
            cursor_y: BORDER_PADDING,
        };
        console.clear();
        *WRITER.lock() = Some(console);
    }

    pub fn clear(&mut self) {
        for y in 0..self.height {
            for x in 0..self.width {
                self.put_pixel(x, y, BACKGROUND);
            }
        }
        self.cursor_x = BORDER_PADDING;
        self.cursor_y = BORDER_PADDING;
    }

    pub fn write_string(&mut self, s: &str) {
        for c in s.chars() {
            match c {
                '\n' => self.new_line(),
                c => {
                    if self.cursor_x + 10 >= self.width {
                        self.new_line();
                    }
                    self.draw_char(c);
                }
            }
        }
    }

    fn new_line(&mut self) {
        self.cursor_y += GLYPH_HEIGHT + LINE_SPACING;
        self.cursor_x = BORDER_PADDING;

        // No scrollback: wrap to the top of a fresh screen.
        if self.cursor_y + GLYPH_HEIGHT + BORDER_PADDING > self.height {
            self.clear();
        }
    }

    fn glyph(c: char) -> Option<RasterizedChar> {
        get_raster(c, FontWeight::Regular, RasterHeight::Size16)
            .or_else(|| get_raster('?', FontWeight::Regular, RasterHeight::Size16))
    }

    fn draw_char(&mut self, c: char) {
        let Some(raster) = Self::glyph(c) else { return };

        for (y, row) in raster.raster().iter().enumerate() {
            for (x, intensity) in row.iter().enumerate() {
                if *intensity > 0 {
                    let i = *intensity as u32;
                    self.put_pixel(self.cursor_x + x, self.cursor_y + y, (i << 16) | (i << 8) | i);
                }
            }
        }
        self.cursor_x += raster.width() + LETTER_SPACING;
    }

    fn put_pixel(&mut self, x: usize, y: usize, color: u32) {
        if x < self.width && y < self.height {
            unsafe { *self.video_ptr.add(y * self.pitch + x) = color };
        }
    }
}

/// Prints to the console if one exists. Uses `try_lock` so a core that
/// faults mid-print does not wedge everyone else.
pub fn print(s: &str) {
    if let Some(mut guard) = WRITER.try_lock() {
        if let Some(console) = guard.as_mut() {
            console.write_string(s);
        }
    }
}
