pub mod background;
pub mod histogram;
pub mod key_color;
pub mod reporter;
pub mod runtime;
pub mod tool_resolver;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PipelineStage {
    Detect,
    Remove,
    Trim,
}

impl PipelineStage {
    pub const ORDER: [Self; 3] = [Self::Detect, Self::Remove, Self::Trim];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Detect => "detect",
            Self::Remove => "remove",
            Self::Trim => "trim",
        }
    }

    pub fn position(self) -> usize {
        match self {
            Self::Detect => 1,
            Self::Remove => 2,
            Self::Trim => 3,
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Detect => "Detecting key color",
            Self::Remove => "Removing background (colorkey + despill)",
            Self::Trim => "Trimming transparent padding",
        }
    }
}
