/// Rolling hash used to derive object ids from definition metadata.
///
/// Must match the flight side bit for bit: every id on the wire and in flash
/// is produced by this function.
#[derive(Default, Debug, Clone, Copy)]
pub struct UavoHash {
    hval: u32,
}

impl UavoHash {
    pub const fn new() -> Self {
        UavoHash { hval: 0 }
    }

    pub fn update(&mut self, value: u32) {
        let h = self.hval;
        self.hval = h ^ (h << 5).wrapping_add(h >> 2).wrapping_add(value);
    }

    pub fn update_str(&mut self, s: &str) {
        for c in s.chars() {
            self.update(c as u32);
        }
    }

    pub fn finish(&self) -> u32 {
        self.hval & 0xFFFF_FFFE
    }
}
