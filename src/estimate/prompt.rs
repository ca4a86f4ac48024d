use crate::models::{EstimateVariant, LotHints};

const UNKNOWN: &str = "Unknown";

const PERSONA: &str = "You are 'Auto Mate', a professional used-car appraiser and repair estimator. \
Analyze the attached vehicle photos and estimate both:\n\
1. The minimum reasonable repair cost to make it presentable and roadworthy for resale (not showroom perfect).\n";

const RESALE_TASK: &str =
    "2. The current resale value range (low, high, average) assuming the repairs are completed.\n";

const FLIP_TASK: &str = "2. Whether the vehicle is worth buying to repair and flip, as a score from 0 \
(walk away) to 10 (excellent flip) with the reasoning behind it.\n";

const RESALE_SHAPE: &str = "{\n  \
'repair': { 'estimate': number, 'details': 'plain-English summary of visible damage and required repairs' },\n  \
'resale': { 'low': number, 'high': number, 'average': number, 'details': 'summary of value factors and reasoning' }\n\
}";

const FLIP_SHAPE: &str = "{\n  \
'repair': { 'estimate': number, 'details': 'plain-English summary of visible damage and required repairs' },\n  \
'evaluation': { 'score': number, 'details': 'why this lot is or is not a good flip' }\n\
}";

pub fn vehicle_block(hints: &LotHints) -> String {
    let field = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(UNKNOWN)
            .to_string()
    };
    format!(
        "Year: {}\nMake: {}\nModel: {}\nMileage: {}",
        field(&hints.year),
        field(&hints.make),
        field(&hints.model),
        field(&hints.mileage),
    )
}

pub fn compose(variant: EstimateVariant, hints: &LotHints) -> String {
    let (task, shape) = match variant {
        EstimateVariant::Resale => (RESALE_TASK, RESALE_SHAPE),
        EstimateVariant::Flip => (FLIP_TASK, FLIP_SHAPE),
    };
    format!(
        "{PERSONA}{task}\nVehicle details:\n{}\n\nRespond ONLY in JSON format exactly like this:\n{shape}",
        vehicle_block(hints)
    )
}
