//! Plot actions shipped with the host. Each produces one [`Primitives`] layer.

use crate::module::{PlotActionModule, PlotContext, Progress, StageError, StageResult};
use crate::params::{Colour, ControlKind, Font, Formatter, ParameterMap, ParameterSpec, ParameterValue};
use crate::render::{LayerContent, Point, Primitive, Primitives};
use crate::tree::{Tree, ATTR_NAME};
use std::sync::Arc;

pub const COLOUR: &str = "Colour";
pub const LINE_WIDTH: &str = "Line width";
pub const ATTRIBUTE: &str = "Attribute";
pub const SHOW_ON: &str = "Show on";
pub const FONT: &str = "Font";
pub const FORMATTER: &str = "Formatter";
pub const MARGIN: &str = "Margin";
pub const IMAGE: &str = "Image";
pub const POSITION: &str = "Position";
pub const WIDTH: &str = "Width";

fn position(context: &PlotContext<'_>, tree: &Tree, idx: crate::tree::NodeIdx) -> Option<Point> {
    let id = &tree.get(idx)?.id;
    context.coordinates.get(id).copied()
}

/// Rectangular branch lines.
pub struct Branches;

impl PlotActionModule for Branches {
    fn get_parameters(&self, _tree: &Tree) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::new(COLOUR, ControlKind::Colour, ParameterValue::Colour(Colour::BLACK)),
            ParameterSpec::new(
                LINE_WIDTH,
                ControlKind::Numeric { min: 0.0, max: 100.0 },
                ParameterValue::Double(1.0),
            ),
        ]
    }

    fn plot(&self, context: &PlotContext<'_>, params: &ParameterMap, progress: Progress<'_>) -> StageResult<Arc<dyn LayerContent>> {
        let tree = context.tree;
        let colour = params.get_colour(COLOUR).unwrap_or(Colour::BLACK);
        let width = params.get_f64(LINE_WIDTH).unwrap_or(1.0);

        let mut primitives = Primitives::new();
        for idx in tree.preorder() {
            let Some(parent) = tree.parent(idx) else {
                continue;
            };
            let (Some(node), Some(anchor)) = (position(context, tree, idx), position(context, tree, parent)) else {
                return Err(StageError::new("coordinates are missing for some nodes"));
            };
            let elbow = Point::new(anchor.x, node.y);
            primitives.push(Primitive::Line {
                from: anchor,
                to: elbow,
                colour,
                width,
            });
            primitives.push(Primitive::Line {
                from: elbow,
                to: node,
                colour,
                width,
            });
        }
        progress(1.0);
        Ok(Arc::new(primitives))
    }
}

/// Text labels built from one attribute through a formatter.
pub struct Labels;

const SHOW_ON_OPTIONS: [&str; 3] = ["Leaves", "Internal nodes", "All nodes"];

impl PlotActionModule for Labels {
    fn get_parameters(&self, _tree: &Tree) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::new(
                ATTRIBUTE,
                ControlKind::AttributeSelector,
                ParameterValue::String(ATTR_NAME.to_string()),
            ),
            ParameterSpec::new(
                SHOW_ON,
                ControlKind::Choice {
                    options: SHOW_ON_OPTIONS.iter().map(|s| s.to_string()).collect(),
                },
                ParameterValue::Int(0),
            ),
            ParameterSpec::new(FONT, ControlKind::Font, ParameterValue::Font(Font::default())),
            ParameterSpec::new(COLOUR, ControlKind::Colour, ParameterValue::Colour(Colour::BLACK)),
            ParameterSpec::new(
                FORMATTER,
                ControlKind::Formatter,
                ParameterValue::Formatter(Formatter::safe_default()),
            ),
            ParameterSpec::new(
                MARGIN,
                ControlKind::Numeric { min: 0.0, max: 1000.0 },
                ParameterValue::Double(5.0),
            ),
        ]
    }

    fn plot(&self, context: &PlotContext<'_>, params: &ParameterMap, progress: Progress<'_>) -> StageResult<Arc<dyn LayerContent>> {
        let tree = context.tree;
        let attribute = params.get_str(ATTRIBUTE).unwrap_or(ATTR_NAME);
        let show_on = params.get_int(SHOW_ON).unwrap_or(0);
        let font = params.get_font(FONT).cloned().unwrap_or_default();
        let colour = params.get_colour(COLOUR).unwrap_or(Colour::BLACK);
        let formatter = params.get_formatter(FORMATTER).cloned().unwrap_or_default();
        let margin = params.get_f64(MARGIN).unwrap_or(5.0);

        let mut primitives = Primitives::new();
        for idx in tree.preorder() {
            let is_leaf = tree.children(idx).is_empty();
            let shown = match show_on {
                0 => is_leaf,
                1 => !is_leaf,
                _ => true,
            };
            if !shown {
                continue;
            }
            let Some(at) = position(context, tree, idx) else {
                continue;
            };
            let value = tree.attribute(idx, attribute);
            let Some(text) = formatter.format(context.engine, value.as_ref()) else {
                continue;
            };
            if text.is_empty() {
                continue;
            }
            primitives.push(Primitive::Text {
                at: Point::new(at.x + margin, at.y),
                text,
                font: font.clone(),
                colour,
            });
        }
        progress(1.0);
        Ok(Arc::new(primitives))
    }
}

/// An image stored as a pipeline attachment, drawn at a fixed position.
pub struct AttachmentImage;

impl PlotActionModule for AttachmentImage {
    fn get_parameters(&self, _tree: &Tree) -> Vec<ParameterSpec> {
        vec![
            ParameterSpec::new(IMAGE, ControlKind::Attachment, ParameterValue::Attachment(String::new())),
            ParameterSpec::new(POSITION, ControlKind::Point, ParameterValue::Point(Point::ORIGIN)),
            ParameterSpec::new(
                WIDTH,
                ControlKind::Numeric { min: 0.0, max: f64::MAX },
                ParameterValue::Double(0.0),
            ),
        ]
    }

    fn plot(&self, context: &PlotContext<'_>, params: &ParameterMap, progress: Progress<'_>) -> StageResult<Arc<dyn LayerContent>> {
        let name = params.get_attachment(IMAGE).unwrap_or_default();
        if name.is_empty() {
            return Ok(Arc::new(Primitives::new()));
        }
        let bytes = context
            .attachments
            .get(name)
            .ok_or_else(|| StageError::new(format!("attachment '{}' not found", name)))?;
        let image = context
            .images
            .get_or_decode(bytes)
            .map_err(|e| StageError::new(format!("attachment '{}': {}", name, e)))?;

        let at = match params.get(POSITION) {
            Some(ParameterValue::Point(p)) => *p,
            _ => Point::ORIGIN,
        };
        let requested = params.get_f64(WIDTH).unwrap_or(0.0);
        let (width, height) = if requested > 0.0 && image.width > 0 {
            (requested, requested * image.height as f64 / image.width as f64)
        } else {
            (image.width as f64, image.height as f64)
        };

        let mut primitives = Primitives::new();
        primitives.push(Primitive::Image {
            at,
            width,
            height,
            image,
        });
        progress(1.0);
        Ok(Arc::new(primitives))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtin::coordinates::Rectangular;
    use crate::module::{Attachments, Coordinates, CoordinatesModule};
    use crate::render::image_cache::tiny_png;
    use crate::render::ImageCache;
    use crate::scripting::ScriptEngine;
    use crate::tree::parse_newick;

    struct Fixture {
        tree: Tree,
        coordinates: Coordinates,
        attachments: Attachments,
        images: ImageCache,
        engine: ScriptEngine,
    }

    impl Fixture {
        fn new(newick: &str) -> Self {
            let tree = parse_newick(newick).unwrap();
            let coordinates = Rectangular.compute(&tree, &ParameterMap::new(), &|_| {}).unwrap();
            Self {
                tree,
                coordinates,
                attachments: Attachments::new(),
                images: ImageCache::new(),
                engine: ScriptEngine::new(),
            }
        }

        fn context(&self) -> PlotContext<'_> {
            PlotContext {
                tree: &self.tree,
                coordinates: &self.coordinates,
                attachments: &self.attachments,
                images: &self.images,
                engine: &self.engine,
            }
        }
    }

    fn primitives(layer: &Arc<dyn LayerContent>) -> &Primitives {
        layer.as_any().downcast_ref::<Primitives>().unwrap()
    }

    #[test]
    fn test_branches_two_segments_per_edge() {
        let fixture = Fixture::new("((A,B),C);");
        let layer = Branches.plot(&fixture.context(), &ParameterMap::new(), &|_| {}).unwrap();
        assert_eq!(primitives(&layer).len(), 2 * (fixture.tree.len() - 1));
    }

    #[test]
    fn test_labels_use_formatter() {
        let fixture = Fixture::new("(A:0.123,B:0.5);");
        let params = ParameterSpec::defaults(&Labels.get_parameters(&fixture.tree))
            .with(ATTRIBUTE, ParameterValue::String("Length".into()))
            .with(FORMATTER, ParameterValue::Formatter(Formatter::decimals(1)));
        let layer = Labels.plot(&fixture.context(), &params, &|_| {}).unwrap();
        let texts: Vec<&str> = primitives(&layer)
            .items
            .iter()
            .filter_map(|p| match p {
                Primitive::Text { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(texts, vec!["0.1", "0.5"]);
    }

    #[test]
    fn test_uncompiled_script_formatter_is_inert() {
        let fixture = Fixture::new("(A,B);");
        let params = ParameterMap::new().with(
            FORMATTER,
            ParameterValue::Formatter(Formatter::script(r#"fn format(v) { "pwned" }"#)),
        );
        let layer = Labels.plot(&fixture.context(), &params, &|_| {}).unwrap();
        assert!(primitives(&layer)
            .items
            .iter()
            .all(|p| !matches!(p, Primitive::Text { text, .. } if text == "pwned")));
    }

    #[test]
    fn test_attachment_image_scales_to_width() {
        let mut fixture = Fixture::new("(A,B);");
        fixture.attachments.insert("logo.png".into(), tiny_png(40, 20).into());
        let params = ParameterMap::new()
            .with(IMAGE, ParameterValue::Attachment("logo.png".into()))
            .with(WIDTH, ParameterValue::Double(80.0));
        let layer = AttachmentImage.plot(&fixture.context(), &params, &|_| {}).unwrap();
        match &primitives(&layer).items[0] {
            Primitive::Image { width, height, .. } => assert_eq!((*width, *height), (80.0, 40.0)),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(fixture.images.len(), 1);
    }

    #[test]
    fn test_missing_attachment_fails() {
        let fixture = Fixture::new("(A,B);");
        let params = ParameterMap::new().with(IMAGE, ParameterValue::Attachment("nope.png".into()));
        assert!(AttachmentImage.plot(&fixture.context(), &params, &|_| {}).is_err());
    }
}
