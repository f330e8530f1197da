//! Small GTFS feeds written into temp dirs for unit tests.

use std::fmt::Write as _;
use std::path::Path;

/// Writes a feed with `trips` trips over `stops` stops, all running on
/// 2022-07-07 in Europe/Brussels. Trip `t{i}` leaves stop `s1` at
/// 08:00 + 10·i minutes and reaches each next stop five minutes later;
/// `shift` minutes are added to every time of `t0`.
pub(crate) fn write_feed(dir: &Path, trips: usize, stops: usize, shift: u32) {
    let put = |name: &str, body: String| std::fs::write(dir.join(name), body).unwrap();

    put(
        "agency.txt",
        "agency_id,agency_name,agency_url,agency_timezone\nA,De Lijn,https://delijn.be,Europe/Brussels\n"
            .into(),
    );
    put(
        "routes.txt",
        "route_id,agency_id,route_short_name,route_long_name,route_type\n\
         r1,A,59,Turnhout - Herentals - Leuven,3\n"
            .into(),
    );
    put(
        "calendar_dates.txt",
        "service_id,date,exception_type\nsvc,20220707,1\n".into(),
    );

    let mut body = String::from("stop_id,stop_code,stop_name,stop_lat,stop_lon\n");
    for s in 1..=stops {
        writeln!(body, "s{s},{s}00,Stop {s},51.{s},4.{s}").unwrap();
    }
    put("stops.txt", body);

    let mut body = String::from("route_id,service_id,trip_id,trip_headsign,direction_id\n");
    for t in 0..trips {
        writeln!(body, "r1,svc,t{t},Leuven,0").unwrap();
    }
    put("trips.txt", body);

    let mut body = String::from("trip_id,arrival_time,departure_time,stop_id,stop_sequence\n");
    for t in 0..trips {
        let base = 8 * 60 + 10 * t as u32 + if t == 0 { shift } else { 0 };
        for s in 1..=stops {
            let m = base + 5 * (s as u32 - 1);
            let time = format!("{:02}:{:02}:00", m / 60, m % 60);
            writeln!(body, "t{t},{time},{time},s{s},{s}").unwrap();
        }
    }
    put("stop_times.txt", body);
}
