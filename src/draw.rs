//! Debug overlays: layout blocks drawn onto the page raster, color-coded
//! by type.

use image::{GrayImage, Rgba, RgbaImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::entities::{BlockType, PageLayout};

const HEADER_COLOR: [u8; 4] = [0, 0, 255, 255];
const BODY_COLOR: [u8; 4] = [17, 138, 1, 255];
const TABLE_COLOR: [u8; 4] = [209, 139, 0, 255];
const FOOTER_COLOR: [u8; 4] = [128, 0, 128, 255];
const HANDWRITING_COLOR: [u8; 4] = [255, 0, 0, 255];

fn color_for(block_type: BlockType) -> Rgba<u8> {
    Rgba(match block_type {
        BlockType::Header => HEADER_COLOR,
        BlockType::Body => BODY_COLOR,
        BlockType::Table => TABLE_COLOR,
        BlockType::Footer => FOOTER_COLOR,
        BlockType::Handwriting => HANDWRITING_COLOR,
    })
}

pub(crate) fn draw_layout_blocks(layout: &PageLayout, page: &GrayImage) -> RgbaImage {
    let mut out_img = image::DynamicImage::ImageLuma8(page.clone()).to_rgba8();

    for block in &layout.blocks {
        let x0 = block.bbox.x0 as i32;
        let y0 = block.bbox.y0 as i32;
        let width = (block.bbox.width() as i32).max(1) as u32;
        let height = (block.bbox.height() as i32).max(1) as u32;

        let rect = Rect::at(x0, y0).of_size(width, height);
        draw_hollow_rect_mut(&mut out_img, rect, color_for(block.block_type));
    }

    out_img
}
