use rand::Rng;

/// WSPR transmit windows per band, in MHz. Keyed by wavelength in metres.
const BANDS: &[(u16, f64, f64)] = &[
    (160, 1.836600, 1.838100),
    (80, 3.568600, 3.570100),
    (60, 5.364700, 5.366200),
    (40, 7.038600, 7.040100),
    (30, 10.138700, 10.140200),
    (20, 14.095600, 14.097100),
    (17, 18.104600, 18.106100),
    (15, 21.094600, 21.096100),
    (12, 24.924600, 24.926100),
    (10, 28.124600, 28.126100),
    (6, 50.293000, 50.294500),
    (4, 70.091000, 70.092500),
    (2, 144.489000, 144.490500),
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandLimits {
    pub band: u16,
    pub lower: f64,
    pub upper: f64,
}

pub fn limits(band: u16) -> Option<BandLimits> {
    BANDS
        .iter()
        .find(|&&(b, _, _)| b == band)
        .map(|&(band, lower, upper)| BandLimits { band, lower, upper })
}

/// Uniformly random frequency inside the band's WSPR window, rounded to 1 Hz.
pub fn random_freq<R: Rng + ?Sized>(band: u16, rng: &mut R) -> Option<f64> {
    let l = limits(band)?;
    let f = rng.gen_range(l.lower..=l.upper);
    // rounding can never leave the window since both limits are whole Hz
    Some((f * 1e6).round() / 1e6)
}

/// Band whose window contains `freq` (MHz), if any.
pub fn find_band(freq: f64) -> Option<BandLimits> {
    BANDS
        .iter()
        .find(|&&(_, lower, upper)| freq >= lower && freq <= upper)
        .map(|&(band, lower, upper)| BandLimits { band, lower, upper })
}
