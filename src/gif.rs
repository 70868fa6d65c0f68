//! Stream-oriented GIF decoder with a pull-parser design.
//!
//! The caller supplies input bytes incrementally; the decoder reports
//! how many it consumed and why it stopped.  Unconsumed input stays
//! the caller's to re-present, so resumption is re-entrant at any
//! split point, including mid-sub-block and mid-color-table.

use log::trace;
use thiserror::Error;

/// Largest code representable in 12 bits; the LZW dictionary never
/// grows past it.
pub const MAX_CODE: usize = 0xFFF;

const MAX_BITS: u32 = 12;

const EXTENSION_INTRODUCER: u8 = 0x21;
const COMMENT_EXTENSION: u8 = 0xFE;
const GRAPHIC_CONTROL_EXTENSION: u8 = 0xF9;
const IMAGE_SEPARATOR: u8 = 0x2C;
const GIF_TRAILER: u8 = 0x3B;

/// The standard interlace pass table: starting scanline and increment
/// per pass.
const PASS_START: [usize; 4] = [0, 4, 2, 1];
const PASS_STEP: [usize; 4] = [8, 8, 4, 2];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GifError {
    #[error("not a GIF signature")]
    BadSignature,
    #[error("unknown block introducer {0:#04x}")]
    BadBlock(u8),
    #[error("LZW code {code} above the highest known code {known}")]
    BadCode { code: usize, known: usize },
}

/// Why a feed call returned.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// Made progress, nothing notable happened.
    Ok,
    /// More input is needed; re-present the unconsumed tail.
    BufferEmpty,
    /// A full image frame is available from [GifDecoder::pixels].
    FrameCompleted,
    /// At least one scanline completed since the last call.
    LineCompleted,
    /// The trailer was consumed; the stream is done.
    Eof,
}

/// Result of one feed call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Feed {
    pub status: Status,
    pub bytes_consumed: usize,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum State {
    Init,
    Header,
    GlobalColorTable,
    BlockBegin,
    LocalColorTable,
    StartingDecompression,
    Decompressing,
    ReadingComment,
    SkippingBlocks,
}

/// LZW decompression state: prefix/suffix dictionary plus the output
/// stack, bounded by [MAX_CODE].
struct Lzw {
    init_code_size: u32,
    code_size: u32,
    clear_code: usize,
    eoi_code: usize,
    next_code: usize,
    prev_code: Option<usize>,
    accum: u32,
    accum_bits: u32,
    prefix: Box<[u16; MAX_CODE + 1]>,
    suffix: Box<[u8; MAX_CODE + 1]>,
    stack: Vec<u8>,
    finished: bool,
}

impl Lzw {
    fn new(init_code_size: u32) -> Lzw {
        let clear_code = 1usize << init_code_size;
        Lzw {
            init_code_size,
            code_size: init_code_size + 1,
            clear_code,
            eoi_code: clear_code + 1,
            next_code: clear_code + 2,
            prev_code: None,
            accum: 0,
            accum_bits: 0,
            prefix: Box::new([0; MAX_CODE + 1]),
            suffix: Box::new([0; MAX_CODE + 1]),
            stack: Vec::with_capacity(MAX_CODE),
            finished: false,
        }
    }

    fn reset_table(&mut self) {
        self.code_size = self.init_code_size + 1;
        self.next_code = self.clear_code + 2;
        self.prev_code = None;
    }

    fn push_byte(&mut self, byte: u8) {
        self.accum |= (byte as u32) << self.accum_bits;
        self.accum_bits += 8;
    }

    fn next_code_from_accum(&mut self) -> Option<usize> {
        if self.accum_bits < self.code_size {
            return None;
        }
        let code = (self.accum & ((1 << self.code_size) - 1)) as usize;
        self.accum >>= self.code_size;
        self.accum_bits -= self.code_size;
        Some(code)
    }

    /// Expands one code onto the output stack (reversed order).
    fn expand(&mut self, code: usize) -> Result<(), GifError> {
        if code == self.clear_code {
            self.reset_table();
            return Ok(());
        }
        if code == self.eoi_code {
            self.finished = true;
            return Ok(());
        }

        let mut cursor = match self.prev_code {
            None => {
                if code >= self.clear_code {
                    return Err(GifError::BadCode {
                        code,
                        known: self.clear_code - 1,
                    });
                }
                self.stack.push(code as u8);
                self.prev_code = Some(code);
                return Ok(());
            }
            Some(prev) => {
                if code > self.next_code {
                    return Err(GifError::BadCode {
                        code,
                        known: self.next_code,
                    });
                }
                if code == self.next_code {
                    // the "code not yet defined" case: string(prev) +
                    // first(prev)
                    let first = self.first_of(prev);
                    self.stack.push(first);
                    prev
                } else {
                    code
                }
            }
        };

        while cursor >= self.clear_code {
            self.stack.push(self.suffix[cursor]);
            cursor = self.prefix[cursor] as usize;
        }
        self.stack.push(cursor as u8);

        if self.next_code <= MAX_CODE {
            if let Some(prev) = self.prev_code {
                self.prefix[self.next_code] = prev as u16;
                self.suffix[self.next_code] = cursor as u8;
                self.next_code += 1;
                if self.next_code == (1 << self.code_size) && self.code_size < MAX_BITS {
                    self.code_size += 1;
                }
            }
        }
        self.prev_code = Some(code);
        Ok(())
    }

    /// First byte of the string a code expands to.
    fn first_of(&self, mut code: usize) -> u8 {
        while code >= self.clear_code {
            code = self.prefix[code] as usize;
        }
        code as u8
    }
}

/// One RGB color table.
#[derive(Debug, Clone, Default)]
pub struct ColorTable {
    pub colors: Vec<[u8; 3]>,
}

/// The incremental decoder.
pub struct GifDecoder {
    state: State,
    screen_width: u16,
    screen_height: u16,
    background: u8,
    global_table: ColorTable,
    global_table_pending: usize,
    local_table: ColorTable,
    local_table_pending: usize,
    // current image descriptor
    frame_left: u16,
    frame_top: u16,
    frame_width: u16,
    frame_height: u16,
    interlaced: bool,
    transparent_color: Option<u8>,
    // decompression position
    lzw: Option<Lzw>,
    block_remaining: usize,
    cur_x: usize,
    cur_y: usize,
    pass: usize,
    rows_done: usize,
    pixels: Vec<u8>,
    comment: Vec<u8>,
    lines_this_call: usize,
    total_consumed: u64,
}

impl Default for GifDecoder {
    fn default() -> GifDecoder {
        GifDecoder::new()
    }
}

impl GifDecoder {
    pub fn new() -> GifDecoder {
        GifDecoder {
            state: State::Init,
            screen_width: 0,
            screen_height: 0,
            background: 0,
            global_table: ColorTable::default(),
            global_table_pending: 0,
            local_table: ColorTable::default(),
            local_table_pending: 0,
            frame_left: 0,
            frame_top: 0,
            frame_width: 0,
            frame_height: 0,
            interlaced: false,
            transparent_color: None,
            lzw: None,
            block_remaining: 0,
            cur_x: 0,
            cur_y: 0,
            pass: 0,
            rows_done: 0,
            pixels: Vec::new(),
            comment: Vec::new(),
            lines_this_call: 0,
            total_consumed: 0,
        }
    }

    pub fn screen_size(&self) -> (u16, u16) {
        (self.screen_width, self.screen_height)
    }

    pub fn frame_size(&self) -> (u16, u16) {
        (self.frame_width, self.frame_height)
    }

    /// Top-left corner of the current frame on the logical screen.
    pub fn frame_origin(&self) -> (u16, u16) {
        (self.frame_left, self.frame_top)
    }

    /// Transparent color index from the last graphic control block.
    pub fn transparent_color(&self) -> Option<u8> {
        self.transparent_color
    }

    pub fn background_color(&self) -> u8 {
        self.background
    }

    pub fn global_palette(&self) -> &ColorTable {
        &self.global_table
    }

    /// The active palette for the current frame.
    pub fn palette(&self) -> &ColorTable {
        if self.local_table.colors.is_empty() {
            &self.global_table
        } else {
            &self.local_table
        }
    }

    /// Indexed pixels of the current frame, row major,
    /// `frame_width * frame_height` long.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn comment(&self) -> &[u8] {
        &self.comment
    }

    /// Total bytes consumed over the decoder's lifetime.
    pub fn total_consumed(&self) -> u64 {
        self.total_consumed
    }

    /// Consumes as much of `input` as possible.  The caller shifts the
    /// unconsumed tail to the front of its buffer and re-presents it
    /// (with more data appended) on the next call.
    pub fn feed(&mut self, input: &[u8]) -> Result<Feed, GifError> {
        let mut pos = 0usize;
        self.lines_this_call = 0;

        let status = loop {
            match self.state {
                State::Init => {
                    self.state = State::Header;
                }
                State::Header => {
                    // signature plus logical screen descriptor
                    if input.len() - pos < 13 {
                        break Status::BufferEmpty;
                    }
                    let header = &input[pos..pos + 13];
                    if &header[..3] != b"GIF" || !(&header[3..6] == b"87a" || &header[3..6] == b"89a")
                    {
                        return Err(GifError::BadSignature);
                    }
                    self.screen_width = u16::from_le_bytes([header[6], header[7]]);
                    self.screen_height = u16::from_le_bytes([header[8], header[9]]);
                    let flags = header[10];
                    self.background = header[11];
                    pos += 13;
                    if flags & 0x80 != 0 {
                        self.global_table_pending = 2 << (flags & 0x07) as usize;
                        self.state = State::GlobalColorTable;
                    } else {
                        self.state = State::BlockBegin;
                    }
                    trace!(
                        "GIF {}x{}, global palette: {}",
                        self.screen_width,
                        self.screen_height,
                        self.global_table_pending
                    );
                }
                State::GlobalColorTable => {
                    // entries arrive one RGB triple at a time, so a
                    // split mid-table resumes cleanly
                    while self.global_table_pending > 0 {
                        if input.len() - pos < 3 {
                            break;
                        }
                        self.global_table
                            .colors
                            .push([input[pos], input[pos + 1], input[pos + 2]]);
                        pos += 3;
                        self.global_table_pending -= 1;
                    }
                    if self.global_table_pending > 0 {
                        break Status::BufferEmpty;
                    }
                    self.state = State::BlockBegin;
                }
                State::BlockBegin => {
                    if input.len() - pos < 1 {
                        break Status::BufferEmpty;
                    }
                    match input[pos] {
                        GIF_TRAILER => {
                            pos += 1;
                            break Status::Eof;
                        }
                        EXTENSION_INTRODUCER => {
                            if input.len() - pos < 2 {
                                break Status::BufferEmpty;
                            }
                            let label = input[pos + 1];
                            match label {
                                GRAPHIC_CONTROL_EXTENSION => {
                                    // fixed size block: introducer,
                                    // label, size(4), data, terminator
                                    if input.len() - pos < 8 {
                                        break Status::BufferEmpty;
                                    }
                                    let packed = input[pos + 3];
                                    self.transparent_color = (packed & 0x01 != 0)
                                        .then(|| input[pos + 6]);
                                    pos += 8;
                                }
                                COMMENT_EXTENSION => {
                                    pos += 2;
                                    self.state = State::ReadingComment;
                                }
                                _ => {
                                    pos += 2;
                                    self.state = State::SkippingBlocks;
                                }
                            }
                        }
                        IMAGE_SEPARATOR => {
                            if input.len() - pos < 10 {
                                break Status::BufferEmpty;
                            }
                            let d = &input[pos + 1..pos + 10];
                            self.frame_left = u16::from_le_bytes([d[0], d[1]]);
                            self.frame_top = u16::from_le_bytes([d[2], d[3]]);
                            self.frame_width = u16::from_le_bytes([d[4], d[5]]);
                            self.frame_height = u16::from_le_bytes([d[6], d[7]]);
                            let flags = d[8];
                            self.interlaced = flags & 0x40 != 0;
                            pos += 10;
                            if flags & 0x80 != 0 {
                                self.local_table = ColorTable::default();
                                self.local_table_pending = 2 << (flags & 0x07) as usize;
                                self.state = State::LocalColorTable;
                            } else {
                                self.local_table = ColorTable::default();
                                self.state = State::StartingDecompression;
                            }
                        }
                        other => return Err(GifError::BadBlock(other)),
                    }
                }
                State::LocalColorTable => {
                    while self.local_table_pending > 0 {
                        if input.len() - pos < 3 {
                            break;
                        }
                        self.local_table
                            .colors
                            .push([input[pos], input[pos + 1], input[pos + 2]]);
                        pos += 3;
                        self.local_table_pending -= 1;
                    }
                    if self.local_table_pending > 0 {
                        break Status::BufferEmpty;
                    }
                    self.state = State::StartingDecompression;
                }
                State::StartingDecompression => {
                    if input.len() - pos < 1 {
                        break Status::BufferEmpty;
                    }
                    let init_code_size = input[pos] as u32;
                    pos += 1;
                    self.lzw = Some(Lzw::new(init_code_size.clamp(2, 11)));
                    self.block_remaining = 0;
                    self.cur_x = 0;
                    self.pass = 0;
                    self.cur_y = if self.interlaced { PASS_START[0] } else { 0 };
                    self.rows_done = 0;
                    self.pixels =
                        vec![0; self.frame_width as usize * self.frame_height as usize];
                    self.state = State::Decompressing;
                }
                State::Decompressing => {
                    if self.block_remaining == 0 {
                        if input.len() - pos < 1 {
                            break Status::BufferEmpty;
                        }
                        self.block_remaining = input[pos] as usize;
                        pos += 1;
                        if self.block_remaining == 0 {
                            // block terminator: the frame is done
                            self.lzw = None;
                            self.state = State::BlockBegin;
                            break Status::FrameCompleted;
                        }
                        continue;
                    }
                    if input.len() - pos < 1 {
                        break Status::BufferEmpty;
                    }
                    let take = self.block_remaining.min(input.len() - pos);
                    for i in 0..take {
                        self.decompress_byte(input[pos + i])?;
                    }
                    pos += take;
                    self.block_remaining -= take;
                }
                State::ReadingComment => {
                    match self.skip_sub_blocks(input, &mut pos, true) {
                        Some(done) => {
                            if done {
                                self.state = State::BlockBegin;
                            }
                        }
                        None => break Status::BufferEmpty,
                    }
                }
                State::SkippingBlocks => {
                    match self.skip_sub_blocks(input, &mut pos, false) {
                        Some(done) => {
                            if done {
                                self.state = State::BlockBegin;
                            }
                        }
                        None => break Status::BufferEmpty,
                    }
                }
            }
        };

        self.total_consumed += pos as u64;
        let status = match status {
            Status::BufferEmpty if self.lines_this_call > 0 => Status::LineCompleted,
            other => other,
        };
        Ok(Feed {
            status,
            bytes_consumed: pos,
        })
    }

    /// Feeds one compressed byte through the LZW state and drains the
    /// output stack into the pixel buffer.
    fn decompress_byte(&mut self, byte: u8) -> Result<(), GifError> {
        let Some(mut lzw) = self.lzw.take() else {
            return Ok(());
        };
        lzw.push_byte(byte);
        while let Some(code) = lzw.next_code_from_accum() {
            if lzw.finished {
                break;
            }
            lzw.expand(code)?;
            while let Some(pixel) = lzw.stack.pop() {
                self.put_pixel(pixel);
            }
        }
        self.lzw = Some(lzw);
        Ok(())
    }

    fn put_pixel(&mut self, pixel: u8) {
        let width = self.frame_width as usize;
        let height = self.frame_height as usize;
        if self.rows_done >= height || width == 0 {
            return; // excess data past the last scanline
        }
        self.pixels[self.cur_y * width + self.cur_x] = pixel;
        self.cur_x += 1;
        if self.cur_x == width {
            self.cur_x = 0;
            self.rows_done += 1;
            self.lines_this_call += 1;
            if self.interlaced {
                self.cur_y += PASS_STEP[self.pass];
                while self.cur_y >= height && self.pass < 3 {
                    self.pass += 1;
                    self.cur_y = PASS_START[self.pass];
                }
            } else {
                self.cur_y += 1;
            }
        }
    }

    /// Walks data sub-blocks; returns None when out of input, or
    /// Some(done) where done means the terminator was consumed.
    fn skip_sub_blocks(&mut self, input: &[u8], pos: &mut usize, keep: bool) -> Option<bool> {
        loop {
            if self.block_remaining == 0 {
                if input.len() - *pos < 1 {
                    return None;
                }
                self.block_remaining = input[*pos] as usize;
                *pos += 1;
                if self.block_remaining == 0 {
                    return Some(true);
                }
            }
            let take = self.block_remaining.min(input.len() - *pos);
            if take == 0 {
                return None;
            }
            if keep {
                self.comment.extend_from_slice(&input[*pos..*pos + take]);
            }
            *pos += take;
            self.block_remaining -= take;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Minimal LZW encoder emitting a clear code before every pixel
    /// code, so the dictionary never grows: valid, trivially correct
    /// compressed data for fixtures.
    fn encode_pixels(init_code_size: u32, pixels: &[u8]) -> Vec<u8> {
        let clear = 1u32 << init_code_size;
        let eoi = clear + 1;
        let code_size = init_code_size + 1;

        let mut bits = Vec::new();
        let mut accum = 0u32;
        let mut accum_bits = 0u32;
        let mut emit = |code: u32, accum: &mut u32, accum_bits: &mut u32| {
            *accum |= code << *accum_bits;
            *accum_bits += code_size;
            while *accum_bits >= 8 {
                bits.push((*accum & 0xFF) as u8);
                *accum >>= 8;
                *accum_bits -= 8;
            }
        };

        emit(clear, &mut accum, &mut accum_bits);
        for &p in pixels {
            emit(p as u32, &mut accum, &mut accum_bits);
            emit(clear, &mut accum, &mut accum_bits);
        }
        emit(eoi, &mut accum, &mut accum_bits);
        if accum_bits > 0 {
            bits.push((accum & 0xFF) as u8);
        }
        bits
    }

    fn tiny_gif(pixels: &[u8], width: u16, height: u16) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(b"GIF89a");
        out.extend_from_slice(&width.to_le_bytes());
        out.extend_from_slice(&height.to_le_bytes());
        out.push(0x80 | 0x01); // global table, 4 entries
        out.push(0); // background
        out.push(0); // aspect
        for color in [[0, 0, 0], [255, 0, 0], [0, 255, 0], [0, 0, 255]] {
            out.extend_from_slice(&color);
        }
        out.push(IMAGE_SEPARATOR);
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&width.to_le_bytes());
        out.extend_from_slice(&height.to_le_bytes());
        out.push(0); // no local table, not interlaced
        out.push(2); // init code size
        let data = encode_pixels(2, pixels);
        for chunk in data.chunks(255) {
            out.push(chunk.len() as u8);
            out.extend_from_slice(chunk);
        }
        out.push(0); // block terminator
        out.push(GIF_TRAILER);
        out
    }

    fn decode_whole(bytes: &[u8]) -> (Vec<u8>, u64) {
        let mut decoder = GifDecoder::new();
        let mut offset = 0;
        let mut frame = Vec::new();
        loop {
            let feed = decoder.feed(&bytes[offset..]).unwrap();
            offset += feed.bytes_consumed;
            match feed.status {
                Status::FrameCompleted => frame = decoder.pixels().to_vec(),
                Status::Eof => break,
                Status::BufferEmpty if offset >= bytes.len() => break,
                _ => {}
            }
        }
        (frame, decoder.total_consumed())
    }

    #[test]
    fn decodes_a_small_frame() {
        let pixels = [1u8, 2, 3, 0, 1, 2];
        let bytes = tiny_gif(&pixels, 3, 2);
        let (frame, consumed) = decode_whole(&bytes);
        assert_eq!(frame, pixels);
        assert_eq!(consumed, bytes.len() as u64);
    }

    #[test]
    fn chunked_decode_equals_whole_decode() {
        let pixels: Vec<u8> = (0..64).map(|i| (i % 4) as u8).collect();
        let bytes = tiny_gif(&pixels, 8, 8);
        let (whole, _) = decode_whole(&bytes);

        // chunk sizes chosen to split mid-header, mid-color-table and
        // mid-sub-block
        for chunk_size in [1, 2, 3, 5, 7, 11] {
            let mut decoder = GifDecoder::new();
            let mut pending: Vec<u8> = Vec::new();
            let mut frame = Vec::new();
            let mut consumed_total = 0u64;
            let mut source = bytes.iter().copied();
            'outer: loop {
                // refill the caller buffer
                for _ in 0..chunk_size {
                    match source.next() {
                        Some(b) => pending.push(b),
                        None => break,
                    }
                }
                loop {
                    let feed = decoder.feed(&pending).unwrap();
                    consumed_total += feed.bytes_consumed as u64;
                    pending.drain(..feed.bytes_consumed);
                    match feed.status {
                        Status::FrameCompleted => frame = decoder.pixels().to_vec(),
                        Status::Eof => break 'outer,
                        Status::BufferEmpty | Status::LineCompleted => break,
                        Status::Ok => {}
                    }
                }
                if pending.is_empty() && source.len() == 0 {
                    break;
                }
            }
            assert_eq!(frame, whole, "chunk size {chunk_size}");
            assert_eq!(consumed_total, bytes.len() as u64, "chunk size {chunk_size}");
        }
    }

    #[test]
    fn interlaced_rows_land_in_pass_order() {
        // 1 wide, 8 tall, interlaced: rows arrive as 0,4,2,6,1,3,5,7
        let mut out = Vec::new();
        out.extend_from_slice(b"GIF89a");
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&8u16.to_le_bytes());
        out.push(0x80 | 0x02); // 8 entries
        out.push(0);
        out.push(0);
        for i in 0..8u8 {
            out.extend_from_slice(&[i, i, i]);
        }
        out.push(IMAGE_SEPARATOR);
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&8u16.to_le_bytes());
        out.push(0x40); // interlaced
        out.push(3);
        let data = encode_pixels(3, &[0, 1, 2, 3, 4, 5, 6, 7]);
        for chunk in data.chunks(255) {
            out.push(chunk.len() as u8);
            out.extend_from_slice(chunk);
        }
        out.push(0);
        out.push(GIF_TRAILER);

        // stream order 0,1,..,7 lands on rows 0,4,2,6,1,3,5,7
        let (frame, _) = decode_whole(&out);
        assert_eq!(frame, vec![0, 4, 2, 5, 1, 6, 3, 7]);
    }

    #[test]
    fn bad_signature_is_an_error() {
        let mut decoder = GifDecoder::new();
        let err = decoder.feed(b"NOTAGIF______").unwrap_err();
        assert_eq!(err, GifError::BadSignature);
    }

    #[test]
    fn comment_blocks_are_collected() {
        let pixels = [0u8];
        let mut bytes = tiny_gif(&pixels, 1, 1);
        // splice a comment extension before the trailer
        let trailer = bytes.pop().unwrap();
        bytes.push(EXTENSION_INTRODUCER);
        bytes.push(COMMENT_EXTENSION);
        bytes.push(5);
        bytes.extend_from_slice(b"hello");
        bytes.push(0);
        bytes.push(trailer);

        let mut decoder = GifDecoder::new();
        let mut offset = 0;
        loop {
            let feed = decoder.feed(&bytes[offset..]).unwrap();
            offset += feed.bytes_consumed;
            if feed.status == Status::Eof {
                break;
            }
        }
        assert_eq!(decoder.comment(), b"hello");
    }
}
