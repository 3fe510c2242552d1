//! Render layers and the drawing primitives plot modules produce.

use super::geometry::{Point, Rect, Transform};
use super::image_cache::DecodedImage;
use crate::params::{Colour, Font};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Content of one layer. Opaque to the coordinator apart from its bounds.
pub trait LayerContent: Send + Sync + fmt::Debug {
    /// Bounds in the layer's own coordinate space; `None` when empty.
    fn bounds(&self) -> Option<Rect>;

    fn as_any(&self) -> &dyn Any;
}

/// One drawing instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    Line {
        from: Point,
        to: Point,
        colour: Colour,
        width: f64,
    },
    Circle {
        centre: Point,
        radius: f64,
        colour: Colour,
    },
    Text {
        at: Point,
        text: String,
        font: Font,
        colour: Colour,
    },
    Image {
        at: Point,
        width: f64,
        height: f64,
        image: Arc<DecodedImage>,
    },
}

impl Primitive {
    pub fn bounds(&self) -> Rect {
        match self {
            Primitive::Line { from, to, width, .. } => Rect::new(*from, *to).inflate(width / 2.0),
            Primitive::Circle { centre, radius, .. } => Rect::new(*centre, *centre).inflate(*radius),
            Primitive::Text { at, text, font, .. } => {
                // Approximate advance: 0.6 em per character
                let width = text.chars().count() as f64 * font.size * 0.6;
                Rect::new(
                    Point::new(at.x, at.y - font.size / 2.0),
                    Point::new(at.x + width, at.y + font.size / 2.0),
                )
            }
            Primitive::Image { at, width, height, .. } => {
                Rect::new(*at, Point::new(at.x + width, at.y + height))
            }
        }
    }
}

/// A list of primitives; the content type produced by plot modules.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Primitives {
    pub items: Vec<Primitive>,
}

impl Primitives {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, primitive: Primitive) {
        self.items.push(primitive);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl LayerContent for Primitives {
    fn bounds(&self) -> Option<Rect> {
        let mut iter = self.items.iter().map(Primitive::bounds);
        let first = iter.next()?;
        Some(iter.fold(first, Rect::union))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A layer as held by the coordinator.
#[derive(Debug, Clone)]
pub struct RenderLayer {
    pub index: usize,
    pub content: Arc<dyn LayerContent>,
    pub bounds: Option<Rect>,
    /// Maps layer coordinates into the shared space
    pub transform: Transform,
}

impl RenderLayer {
    pub fn new(index: usize, content: Arc<dyn LayerContent>) -> Self {
        let bounds = content.bounds();
        Self {
            index,
            content,
            bounds,
            transform: Transform::IDENTITY,
        }
    }

    /// Downcast the content to a concrete type.
    pub fn content_as<T: 'static>(&self) -> Option<&T> {
        self.content.as_any().downcast_ref::<T>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives_bounds() {
        let mut p = Primitives::new();
        assert_eq!(p.bounds(), None);
        p.push(Primitive::Line {
            from: Point::new(0.0, 0.0),
            to: Point::new(10.0, 0.0),
            colour: Colour::BLACK,
            width: 2.0,
        });
        p.push(Primitive::Circle {
            centre: Point::new(5.0, 5.0),
            radius: 1.0,
            colour: Colour::BLACK,
        });
        let b = p.bounds().unwrap();
        assert_eq!(b.min, Point::new(-1.0, -1.0));
        assert_eq!(b.max, Point::new(11.0, 6.0));
    }

    #[test]
    fn test_layer_downcast() {
        let layer = RenderLayer::new(0, Arc::new(Primitives::new()));
        assert!(layer.content_as::<Primitives>().is_some());
        assert!(layer.bounds.is_none());
    }
}
