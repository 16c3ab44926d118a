//! Splitting flat firmware images into device pages

/// Value of erased flash, used to pad the final page
pub const ERASED: u8 = 0xFF;

/// One page of flash
#[derive(Clone, PartialEq, Debug)]
pub struct Page {
    /// Page-aligned byte address
    pub address: u32,
    pub data: Vec<u8>,
}

/// Split an image starting at address zero into `page_size` pages, padding
/// the last page with [`ERASED`]
pub fn pages(image: &[u8], page_size: u16) -> impl Iterator<Item = Page> + '_ {
    let page_size = usize::from(page_size.max(1));

    image.chunks(page_size).enumerate().map(move |(i, chunk)| {
        let mut data = chunk.to_vec();
        data.resize(page_size, ERASED);

        Page {
            address: (i * page_size) as u32,
            data,
        }
    })
}
