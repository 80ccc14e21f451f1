//! CRC checksums for archive content verification
//!
//! Provides CRC32 (IEEE 802.3, reflected polynomial 0xEDB88320) as used by
//! zip and jar, and a combined content digest that additionally tracks the
//! plain byte sum required by cpio's crc format.

/// CRC32 lookup table (IEEE 802.3 polynomial, reflected: 0xEDB88320)
const CRC32_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut j = 0;
        while j < 8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
            j += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
};

/// CRC32 checksum calculator (IEEE 802.3)
#[derive(Debug, Clone)]
pub struct Crc32 {
    crc: u32,
}

impl Crc32 {
    /// Create a new CRC32 calculator
    pub fn new() -> Self {
        Self { crc: 0xFFFFFFFF }
    }

    /// Reset to initial state
    pub fn reset(&mut self) {
        self.crc = 0xFFFFFFFF;
    }

    /// Update with data
    pub fn update(&mut self, data: &[u8]) {
        let mut crc = self.crc;
        for &byte in data {
            let index = ((crc ^ byte as u32) & 0xFF) as usize;
            crc = (crc >> 8) ^ CRC32_TABLE[index];
        }
        self.crc = crc;
    }

    /// Get current CRC value without consuming the calculator
    pub fn value(&self) -> u32 {
        self.crc ^ 0xFFFFFFFF
    }

    /// Get final CRC value
    pub fn finalize(self) -> u32 {
        self.crc ^ 0xFFFFFFFF
    }

    /// Compute CRC32 of data in one call
    pub fn compute(data: &[u8]) -> u32 {
        let mut crc = Self::new();
        crc.update(data);
        crc.finalize()
    }
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

/// Running digest over one entry's content, computed in a single pass.
///
/// Tracks the CRC32, the wrapping byte sum and the byte count. Zip data
/// descriptors are checked against the CRC32, cpio `070702` headers against
/// the byte sum.
#[derive(Debug, Clone)]
pub struct ContentDigest {
    crc: Crc32,
    sum: u32,
    len: u64,
}

impl ContentDigest {
    /// Create an empty digest
    pub fn new() -> Self {
        Self {
            crc: Crc32::new(),
            sum: 0,
            len: 0,
        }
    }

    /// Update with content bytes
    pub fn update(&mut self, data: &[u8]) {
        self.crc.update(data);
        let mut sum = self.sum;
        for &byte in data {
            sum = sum.wrapping_add(byte as u32);
        }
        self.sum = sum;
        self.len += data.len() as u64;
    }

    /// CRC32 of the bytes seen so far
    pub fn crc32(&self) -> u32 {
        self.crc.value()
    }

    /// Wrapping sum of the bytes seen so far
    pub fn byte_sum(&self) -> u32 {
        self.sum
    }

    /// Number of bytes seen so far
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Check whether no bytes were digested yet
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Default for ContentDigest {
    fn default() -> Self {
        Self::new()
    }
}
