//! Rasterize an assignment grid into an RGB image.

use image::{Rgb, RgbImage};

use crate::jfa::AssignmentGrid;
use crate::site::Site;

/// Grey (0.3) shown where no site claims a cell
const BACKGROUND: [u8; 3] = [77, 77, 77];
const INK: [u8; 3] = [0, 0, 0];

/// Overlays drawn on top of the cell colors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderStyle {
    pub draw_sites: bool,
    pub draw_borders: bool,
    /// Border thickness and site dot radius, in cells
    pub line_width: u32,
}

impl Default for RenderStyle {
    fn default() -> Self {
        Self {
            draw_sites: false,
            draw_borders: false,
            line_width: 1,
        }
    }
}

/// One pixel per grid cell, colored by the owning site.
pub fn render(grid: &AssignmentGrid, sites: &[Site], style: &RenderStyle) -> RgbImage {
    let (width, height) = (grid.width(), grid.height());
    let mut image = RgbImage::from_fn(width, height, |x, y| {
        let rgb = grid
            .site_at(x, y)
            .and_then(|id| sites.get(id as usize))
            .map_or(BACKGROUND, |site| site.color.to_rgb8());
        Rgb(rgb)
    });

    let thickness = style.line_width.max(1);

    if style.draw_borders {
        // a cell is on an edge when its right or lower neighbor differs
        let edge: Vec<bool> = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| {
                let here = grid.site_at(x, y);
                (x + 1 < width && grid.site_at(x + 1, y) != here)
                    || (y + 1 < height && grid.site_at(x, y + 1) != here)
            })
            .collect();
        for y in 0..height {
            for x in 0..width {
                let near_edge = (0..thickness).any(|dy| {
                    (0..thickness).any(|dx| {
                        let (ex, ey) = (x + dx, y + dy);
                        ex < width && ey < height && edge[(ey * width + ex) as usize]
                    })
                });
                if near_edge {
                    image.put_pixel(x, y, Rgb(INK));
                }
            }
        }
    }

    if style.draw_sites {
        draw_sites(&mut image, sites, thickness as i64);
    }

    image
}

/// Square dots of `radius` cells at each site position
fn draw_sites(image: &mut RgbImage, sites: &[Site], radius: i64) {
    let (w, h) = (image.width() as i64, image.height() as i64);
    for site in sites {
        let cx = (site.pos.x * w as f32).floor() as i64;
        let cy = (site.pos.y * h as f32).floor() as i64;
        for dy in -radius..=radius {
            for dx in -radius..=radius {
                let px = cx + dx;
                let py = cy + dy;
                if px >= 0 && px < w && py >= 0 && py < h {
                    image.put_pixel(px as u32, py as u32, Rgb(INK));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Color, CpuDispatch, JfaEngine, Position};

    fn two_sites() -> Vec<Site> {
        vec![
            Site::new(Position::new(0.25, 0.5), Color::new(1.0, 0.0, 0.0)),
            Site::new(Position::new(0.75, 0.5), Color::new(0.0, 1.0, 0.0)),
        ]
    }

    #[test]
    fn test_cells_take_site_colors() {
        let sites = two_sites();
        let grid = JfaEngine::new(CpuDispatch::new()).run(&sites, 8, 4).unwrap();
        let image = render(&grid, &sites, &RenderStyle::default());
        assert_eq!(image.dimensions(), (8, 4));
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(image.get_pixel(7, 3).0, [0, 255, 0]);
    }

    #[test]
    fn test_unclaimed_is_background() {
        let grid = JfaEngine::new(CpuDispatch::new()).run(&[], 4, 4).unwrap();
        let image = render(&grid, &[], &RenderStyle::default());
        assert!(image.pixels().all(|p| p.0 == BACKGROUND));
    }

    #[test]
    fn test_borders_and_dots() {
        let sites = two_sites();
        let grid = JfaEngine::new(CpuDispatch::new()).run(&sites, 8, 4).unwrap();
        let style = RenderStyle {
            draw_borders: true,
            ..RenderStyle::default()
        };
        let image = render(&grid, &sites, &style);
        // boundary between columns 3 and 4
        assert_eq!(image.get_pixel(3, 1).0, INK);
        assert_eq!(image.get_pixel(4, 1).0, [0, 255, 0]);
        assert_eq!(image.get_pixel(0, 1).0, [255, 0, 0]);

        let style = RenderStyle {
            draw_sites: true,
            ..RenderStyle::default()
        };
        let image = render(&grid, &sites, &style);
        assert_eq!(image.get_pixel(2, 2).0, INK);
        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0]);
    }
}
