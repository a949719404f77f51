use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

const READ_BUFFER_SIZE: usize = 1 << 16;
const AVERAGE_LINE_LENGTH: usize = 32;

/// A contiguous byte range `[start, end)` of the input assigned to one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: u64,
    pub end: u64,
}

impl Segment {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Splits `size` bytes into `workers` ranges of `ceil(size / workers)`, the last one running to `size`.
pub fn partition(size: u64, workers: usize) -> Vec<Segment> {
    let workers = workers.max(1) as u64;
    let chunk = size.div_ceil(workers);
    (0..workers)
        .map(|i| Segment {
            start: (i * chunk).min(size),
            end: if i == workers - 1 { size } else { ((i + 1) * chunk).min(size) },
        })
        .collect()
}

/// Feeds `on_line` every line whose first byte falls inside `segment`.
///
/// A worker starting mid-file skips forward to the first line boundary at or after its start;
/// the line it lands inside belongs to the previous segment. Returns the number of lines seen.
pub fn scan_segment<F>(path: &Path, segment: Segment, mut on_line: F) -> io::Result<u64>
where
    F: FnMut(&str),
{
    if segment.is_empty() {
        return Ok(0);
    }
    let file = File::open(path)?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, file);
    let mut line = Vec::with_capacity(AVERAGE_LINE_LENGTH);

    let mut position = segment.start;
    if segment.start > 0 {
        reader.seek(SeekFrom::Start(segment.start - 1))?;
        position = segment.start - 1 + reader.read_until(b'\n', &mut line)? as u64;
    }

    let mut lines = 0;
    while position < segment.end {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            break;
        }
        position += read as u64;
        lines += 1;
        let text = String::from_utf8_lossy(&line);
        on_line(text.trim_end_matches(['\n', '\r']));
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {

    use std::io::Write;

    use super::{partition, scan_segment, Segment};

    #[test]
    fn test_partition_sizes() {
        assert_eq!(
            partition(10, 3),
            vec![
                Segment { start: 0, end: 4 },
                Segment { start: 4, end: 8 },
                Segment { start: 8, end: 10 },
            ]
        );
        let segments = partition(5, 8);
        assert_eq!(segments.len(), 8);
        assert_eq!(segments.iter().map(Segment::len).sum::<u64>(), 5);
        assert_eq!(segments.last().unwrap().end, 5);
        assert_eq!(partition(7, 0), vec![Segment { start: 0, end: 7 }]);
    }

    #[test]
    fn test_every_line_scanned_exactly_once() {
        let lines: Vec<String> = (0..97)
            .map(|i| format!("1/{}/2024 {}:00:00 {}.{}", i % 28 + 1, i % 24, 60 + i, i % 10))
            .collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in &lines {
            writeln!(file, "{line}").unwrap();
        }
        let size = file.as_file().metadata().unwrap().len();

        for workers in [1, 2, 3, 7, 16, 200] {
            let mut seen = Vec::new();
            let mut counted = 0;
            for segment in partition(size, workers) {
                counted += scan_segment(file.path(), segment, |line| seen.push(line.to_string())).unwrap();
            }
            assert_eq!(counted as usize, lines.len(), "workers = {workers}");
            assert_eq!(seen, lines, "workers = {workers}");
        }
    }

    #[test]
    fn test_boundary_on_line_start() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "aaa\nbbb\nccc").unwrap();
        let mut first = Vec::new();
        let mut second = Vec::new();
        scan_segment(file.path(), Segment { start: 0, end: 4 }, |l| first.push(l.to_string())).unwrap();
        scan_segment(file.path(), Segment { start: 4, end: 11 }, |l| second.push(l.to_string())).unwrap();
        assert_eq!(first, vec!["aaa"]);
        assert_eq!(second, vec!["bbb", "ccc"]);
    }
}
