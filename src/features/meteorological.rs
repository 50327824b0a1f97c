//! Wind, thermodynamic, stability and solar features.
//!
//! Each group is derived only when its source columns are present; nothing is
//! injected with default values.

use crate::frame::Frame;
use crate::series;

use super::TemperatureUnit;

const WIND_SPEED_EDGES: [f64; 6] = [0.0, 2.0, 5.0, 10.0, 15.0, f64::INFINITY];
const TEMP_EDGES: [f64; 7] = [
    f64::NEG_INFINITY,
    0.0,
    10.0,
    20.0,
    30.0,
    40.0,
    f64::INFINITY,
];

/// Denominator guard for wind-speed ratios.
const WIND_EPS: f64 = 0.1;
const HUMIDITY_EPS: f64 = 1e-8;

/// Derive meteorological features. `unit` must already be resolved (not `Auto`);
/// an `Auto` here falls back to the mean heuristic on this frame alone.
pub fn add_meteorological_features(mut frame: Frame, unit: TemperatureUnit, latitude: f64) -> Frame {
    add_wind(&mut frame);
    add_vertical(&mut frame);
    add_temperature(&mut frame, unit);
    add_humidity(&mut frame);
    add_stability(&mut frame);
    add_pressure(&mut frame);
    add_solar(&mut frame, latitude);
    add_comfort(&mut frame);
    tracing::debug!(columns = frame.width(), "Created meteorological features");
    frame
}

fn zip_map(a: &[f64], b: &[f64], f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    a.iter().zip(b).map(|(&x, &y)| f(x, y)).collect()
}

fn map(a: &[f64], f: impl Fn(f64) -> f64) -> Vec<f64> {
    a.iter().map(|&x| f(x)).collect()
}

fn add_wind(frame: &mut Frame) {
    let (Some(u), Some(v)) = (frame.column("u_forecast"), frame.column("v_forecast")) else {
        return;
    };
    let (u, v) = (u.to_vec(), v.to_vec());

    let speed = zip_map(&u, &v, f64::hypot);
    let direction = zip_map(&u, &v, |u, v| (v.atan2(u).to_degrees() + 360.0) % 360.0);
    let shear: Vec<f64> = zip_map(&series::diff(&u, 1), &series::diff(&v, 1), |du, dv| {
        du.abs() + dv.abs()
    });

    frame.set("wind_dir_N", map(&direction, |d| d.to_radians().cos()));
    frame.set("wind_dir_E", map(&direction, |d| d.to_radians().sin()));
    frame.set(
        "wind_speed_category",
        map(&speed, |s| series::cut(s, &WIND_SPEED_EDGES)),
    );
    frame.set("wind_power", map(&speed, |s| s.powi(3)));
    frame.set("wind_shear", shear);
    frame.set("wind_direction", direction);
    frame.set("wind_speed", speed);
}

fn add_vertical(frame: &mut Frame) {
    let Some(w) = frame.column("w_forecast").map(<[f64]>::to_vec) else {
        return;
    };
    frame.set("vertical_wind_abs", map(&w, f64::abs));
    frame.set("vertical_stability", map(&w, |w| if w > 0.0 { 1.0 } else { -1.0 }));
    frame.set("vertical_wind_squared", map(&w, |w| w * w));
    if let Some(speed) = frame.column("wind_speed").map(<[f64]>::to_vec) {
        frame.set("mixing_potential", zip_map(&speed, &w, |s, w| s * w.abs()));
    }
}

fn add_temperature(frame: &mut Frame, unit: TemperatureUnit) {
    let Some(t) = frame.column("T_forecast").map(<[f64]>::to_vec) else {
        return;
    };
    let unit = unit.resolve(&t);
    let celsius = map(&t, |v| unit.to_celsius(v));
    let gradient = series::diff(&celsius, 1);
    let hour = frame
        .column("hour")
        .map_or_else(|| vec![0.0; frame.len()], <[f64]>::to_vec);

    frame.set("temp_category", map(&celsius, |c| series::cut(c, &TEMP_EDGES)));
    frame.set("temp_gradient_abs", map(&gradient, f64::abs));
    frame.set("temp_gradient", gradient);
    frame.set(
        "temp_sin_daily",
        map(&hour, |h| (2.0 * std::f64::consts::PI * h / 24.0).sin()),
    );
    frame.set(
        "temp_cos_daily",
        map(&hour, |h| (2.0 * std::f64::consts::PI * h / 24.0).cos()),
    );
    frame.set("temp_celsius", celsius);
}

/// Tetens saturation vapour pressure in kPa.
fn saturation_vapor_pressure(celsius: f64) -> f64 {
    0.6108 * (17.27 * celsius / (celsius + 237.3)).exp()
}

fn add_humidity(frame: &mut Frame) {
    let Some(q) = frame.column("q_forecast").map(<[f64]>::to_vec) else {
        return;
    };
    frame.set("humidity_log", map(&q, |q| (q + HUMIDITY_EPS).ln()));
    frame.set("humidity_sqrt", map(&q, f64::sqrt));

    let Some(t) = frame.column("temp_celsius").map(<[f64]>::to_vec) else {
        return;
    };
    let es = map(&t, saturation_vapor_pressure);
    let mixing_ratio = map(&q, |q| q / (1.0 - q + HUMIDITY_EPS));
    let rh = zip_map(&mixing_ratio, &es, |mr, es| {
        (mr / (es + HUMIDITY_EPS) * 100.0).min(100.0)
    });
    let dew_point = zip_map(&t, &rh, |t, rh| t - (100.0 - rh) / 5.0);
    let vpd = zip_map(&es, &rh, |es, rh| es - rh / 100.0 * es);

    frame.set("saturation_vapor_pressure", es);
    frame.set("mixing_ratio", mixing_ratio);
    frame.set("relative_humidity_approx", rh);
    frame.set("dew_point_approx", dew_point);
    frame.set("vpd", vpd);
}

fn add_stability(frame: &mut Frame) {
    let speed = frame.column("wind_speed").map(<[f64]>::to_vec);
    let w = frame.column("w_forecast").map(<[f64]>::to_vec);
    let t = frame.column("temp_celsius").map(<[f64]>::to_vec);
    let gradient = frame.column("temp_gradient").map(<[f64]>::to_vec);

    if let (Some(speed), Some(w)) = (&speed, &w) {
        frame.set(
            "atmospheric_stability",
            zip_map(w, speed, |w, s| w / (s + WIND_EPS)),
        );
        if let (Some(gradient), Some(t)) = (&gradient, &t) {
            let ri = (0..frame.len())
                .map(|i| (gradient[i] / (t[i] + 273.15)) / (speed[i] + WIND_EPS).powi(2))
                .collect();
            frame.set("richardson_number", ri);
        }
    }

    if let (Some(t), Some(speed)) = (&t, &speed) {
        frame.set(
            "stability_parameter",
            zip_map(t, speed, |t, s| t / (s + WIND_EPS).powi(2)),
        );
        if let Some(w) = &w {
            frame.set("convective_velocity", zip_map(w, t, convective_velocity));
        }
    }
}

/// Real cube root of `|w|·T`; a negative product has no real float power and is NaN.
fn convective_velocity(w: f64, t: f64) -> f64 {
    let product = w.abs() * t;
    if product < 0.0 { f64::NAN } else { product.cbrt() }
}

fn add_pressure(frame: &mut Frame) {
    let Some(p) = frame
        .column("pressure")
        .or_else(|| frame.column("p_forecast"))
        .map(<[f64]>::to_vec)
    else {
        return;
    };
    let smoothed = series::rolling_mean(&p, 3, 3);
    frame.set("pressure_gradient", series::diff(&p, 1));
    frame.set("pressure_tendency", series::diff(&smoothed, 1));
}

fn add_solar(frame: &mut Frame, latitude: f64) {
    let (Some(hour), Some(month)) = (frame.column("hour"), frame.column("month")) else {
        return;
    };
    let (hour, month) = (hour.to_vec(), month.to_vec());
    let doy = frame
        .column("day_of_year")
        .map_or_else(|| map(&month, |m| m * 30.0), <[f64]>::to_vec);
    let lat = latitude.to_radians();

    let elevation: Vec<f64> = zip_map(&hour, &doy, |h, d| {
        let declination = (23.45 * (360.0 * (284.0 + d) / 365.0).to_radians().sin()).to_radians();
        let hour_angle = (15.0 * (h - 12.0)).to_radians();
        (lat.sin() * declination.sin() + lat.cos() * declination.cos() * hour_angle.cos()).asin()
    });
    let proxy = map(&elevation, |e| e.sin().max(0.0));

    if let Some(t) = frame.column("temp_celsius").map(<[f64]>::to_vec) {
        frame.set(
            "photochemical_potential",
            zip_map(&proxy, &t, |p, t| p * (t + 273.15) / 300.0),
        );
    }
    frame.set("solar_elevation", map(&elevation, f64::to_degrees));
    frame.set("solar_radiation_proxy", proxy);
}

fn add_comfort(frame: &mut Frame) {
    let (Some(t), Some(speed)) = (frame.column("temp_celsius"), frame.column("wind_speed")) else {
        return;
    };
    let (t, speed) = (t.to_vec(), speed.to_vec());

    if let Some(rh) = frame.column("relative_humidity_approx").map(<[f64]>::to_vec) {
        frame.set("heat_index", zip_map(&t, &rh, |t, rh| t + 0.5 * (rh - 50.0) / 10.0));
    }
    let chill = zip_map(&t, &speed, |t, s| {
        let k = (s * 3.6).powf(0.16);
        13.12 + 0.6215 * t - 11.37 * k + 0.3965 * t * k
    });
    frame.set("wind_chill", chill);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn weather() -> Frame {
        Frame::from_columns([
            ("hour", vec![12.0, 13.0, 14.0]),
            ("month", vec![6.0, 6.0, 6.0]),
            ("u_forecast", vec![3.0, 0.0, 0.0]),
            ("v_forecast", vec![4.0, 1.0, 0.0]),
            ("w_forecast", vec![0.5, -0.2, 0.0]),
            ("T_forecast", vec![303.15, 304.15, 305.15]),
            ("q_forecast", vec![0.01, 0.012, 0.0]),
        ])
        .unwrap()
    }

    // ==================== Wind ====================

    #[test]
    fn test_wind_speed_and_direction() {
        let out = add_meteorological_features(weather(), TemperatureUnit::Kelvin, 28.6);
        let speed = out.column("wind_speed").unwrap();
        assert!(approx(speed[0], 5.0));
        let dir = out.column("wind_direction").unwrap();
        assert!(approx(dir[1], 90.0));
        assert!((0.0..360.0).contains(&dir[0]));
        assert_eq!(out.column("wind_speed_category").unwrap()[0], 1.0);
        // Zero speed falls outside the first bin
        assert!(out.column("wind_speed_category").unwrap()[2].is_nan());
        assert!(out.column("wind_shear").unwrap()[0].is_nan());
        assert!(approx(out.column("wind_shear").unwrap()[1], 6.0));
    }

    #[test]
    fn test_zero_wind_ratios_are_finite() {
        let out = add_meteorological_features(weather(), TemperatureUnit::Kelvin, 28.6);
        for name in ["atmospheric_stability", "stability_parameter", "richardson_number"] {
            let col = out.column(name).unwrap();
            assert!(col[2].is_finite(), "{name} not finite at zero wind");
        }
    }

    // ==================== Temperature ====================

    #[test]
    fn test_kelvin_conversion_and_category() {
        let out = add_meteorological_features(weather(), TemperatureUnit::Kelvin, 28.6);
        let c = out.column("temp_celsius").unwrap();
        assert!(approx(c[0], 30.0));
        assert_eq!(out.column("temp_category").unwrap()[0], 3.0);
        assert!(approx(out.column("temp_gradient").unwrap()[1], 1.0));
    }

    #[test]
    fn test_celsius_kept_as_is() {
        let mut frame = weather();
        frame.insert("T_forecast", vec![25.0, 26.0, 27.0]).unwrap();
        let out = add_meteorological_features(frame, TemperatureUnit::Celsius, 28.6);
        assert_eq!(out.column("temp_celsius").unwrap(), &[25.0, 26.0, 27.0]);
    }

    #[test]
    fn test_humidity_guards_zero() {
        let out = add_meteorological_features(weather(), TemperatureUnit::Kelvin, 28.6);
        assert!(out.column("humidity_log").unwrap()[2].is_finite());
        assert!(out.column("relative_humidity_approx").unwrap().iter().all(|v| *v <= 100.0));
    }

    #[test]
    fn test_vapor_pressure_deficit_column() {
        let out = add_meteorological_features(weather(), TemperatureUnit::Kelvin, 28.6);
        let es = out.column("saturation_vapor_pressure").unwrap();
        let rh = out.column("relative_humidity_approx").unwrap();
        let vpd = out.column("vpd").unwrap();
        assert!(approx(vpd[0], es[0] - rh[0] / 100.0 * es[0]));
        assert!(!out.contains("vapor_pressure_deficit"));
    }

    #[test]
    fn test_convective_velocity_negative_is_nan() {
        assert!(convective_velocity(1.0, -5.0).is_nan());
        assert!(approx(convective_velocity(-2.0, 4.0), 2.0));
    }

    // ==================== Solar ====================

    #[test]
    fn test_solar_proxy_peaks_at_noon() {
        let frame = Frame::from_columns([
            ("hour", vec![0.0, 12.0]),
            ("month", vec![6.0, 6.0]),
        ])
        .unwrap();
        let out = add_meteorological_features(frame, TemperatureUnit::Celsius, 28.6);
        let proxy = out.column("solar_radiation_proxy").unwrap();
        assert_eq!(proxy[0], 0.0);
        assert!(proxy[1] > 0.9);
        assert!(!out.contains("photochemical_potential"));
    }

    #[test]
    fn test_missing_sources_add_nothing() {
        let frame = Frame::from_columns([("x", vec![1.0])]).unwrap();
        let out = add_meteorological_features(frame, TemperatureUnit::Celsius, 28.6);
        assert_eq!(out.width(), 1);
    }

    #[test]
    fn test_pressure_tendency() {
        let frame = Frame::from_columns([("p_forecast", vec![1000.0, 1001.0, 1002.0, 1006.0])]).unwrap();
        let out = add_meteorological_features(frame, TemperatureUnit::Celsius, 28.6);
        let tendency = out.column("pressure_tendency").unwrap();
        assert!(tendency[2].is_nan());
        assert!(approx(tendency[3], 2.0));
    }
}
