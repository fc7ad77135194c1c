use tracing::{debug, error, warn};

use super::{decode::decode, DecodedValue, DefinitionTable, RegisterReader, UnitId};

/// Read and decode every parameter of `table`, in table order, one read at a time.
///
/// A failed read only drops that parameter from this pass. Decoding errors (a response with the wrong number of
/// words, an impossible register count) mean the reader or the table is broken and are returned to the caller.
#[tracing::instrument(level = "debug", skip(reader, table), fields(parameters = table.len()))]
pub async fn read_parameters<R>(
    reader: &mut R,
    table: &DefinitionTable,
    unit: UnitId,
) -> crate::Result<Vec<DecodedValue>>
where
    R: RegisterReader + ?Sized,
{
    let mut values = Vec::with_capacity(table.len());

    for parameter in table.parameters() {
        let address = parameter.register;
        let count = parameter.count;
        debug!(name = %parameter.name, address, count, unit, "Read register");

        let words = match reader.read_holding_registers(unit, address, count).await {
            Ok(words) => words,
            Err(error) => {
                error!(
                    name = %parameter.name,
                    address,
                    count,
                    unit,
                    %error,
                    "Error reading register"
                );
                continue;
            }
        };

        let value = decode(parameter, &words, table.double_word)?;
        debug!(name = %value.name, value = %value.value, raw = ?words, "Received value");
        values.push(value);
    }

    Ok(values)
}

/// Walk single registers upwards from `start`, handing every successful read to `found`.
///
/// Stops after `max_errors` failed reads in total or once the address space is exhausted. Returns the number of
/// registers that answered.
pub async fn scan_registers<R, F>(
    reader: &mut R,
    unit: UnitId,
    start: u16,
    max_errors: usize,
    mut found: F,
) -> usize
where
    R: RegisterReader + ?Sized,
    F: FnMut(u16, u16),
{
    let mut errors = 0;
    let mut answered = 0;

    for address in start..=u16::MAX {
        match reader.read_holding_registers(unit, address, 1).await {
            Ok(words) => match words.first() {
                Some(&word) => {
                    found(address, word);
                    answered += 1;
                }
                None => warn!(address, "Empty response"),
            },
            Err(error) => {
                errors += 1;
                error!(address, unit, %error, errors, "Error reading register");
                if errors >= max_errors {
                    break;
                }
            }
        }
    }

    answered
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::modbus::{DoubleWord, Magnitude, ParameterDefinition};
    use crate::Error;
    use pretty_assertions::assert_eq;
    use std::{collections::VecDeque, io};

    /// A reader that replays canned responses and records every request it receives.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedReader {
        pub responses: VecDeque<io::Result<Vec<u16>>>,
        pub requests: Vec<(UnitId, u16, u16)>,
    }

    impl ScriptedReader {
        pub fn new(responses: impl IntoIterator<Item = io::Result<Vec<u16>>>) -> Self {
            Self {
                responses: responses.into_iter().collect(),
                requests: vec![],
            }
        }
    }

    #[async_trait::async_trait]
    impl RegisterReader for ScriptedReader {
        async fn read_holding_registers(
            &mut self,
            unit: UnitId,
            address: u16,
            count: u16,
        ) -> io::Result<Vec<u16>> {
            self.requests.push((unit, address, count));
            self.responses
                .pop_front()
                .unwrap_or_else(|| Err(io::Error::new(io::ErrorKind::TimedOut, "no response")))
        }
    }

    pub(crate) fn table() -> DefinitionTable {
        let parameter = |name: &str, register, count, scale: Option<&str>| ParameterDefinition {
            name: name.to_owned(),
            register,
            count,
            scale: scale.map(|s| s.parse().unwrap()),
            device_class: None,
            state_class: None,
            unit: None,
        };

        DefinitionTable::new(
            crate::modbus::definition::SerialSettings {
                baudrate: 9600,
                bytesize: 8,
                parity: "N".to_owned(),
                stopbits: 1,
            },
            DoubleWord::Base65536,
            vec![
                parameter("energy_total", 0x1C, 2, Some("0.01")),
                parameter("voltage", 0x23, 1, None),
                parameter("current", 0x24, 1, Some("0.1")),
            ],
        )
        .unwrap()
    }

    #[tokio::test]
    async fn reads_every_parameter_in_order() {
        let mut reader = ScriptedReader::new([Ok(vec![500, 2]), Ok(vec![230]), Ok(vec![52])]);

        let values = read_parameters(&mut reader, &table(), 7).await.unwrap();

        assert_eq!(
            reader.requests,
            vec![(7, 0x1C, 2), (7, 0x23, 1), (7, 0x24, 1)]
        );
        let magnitudes: Vec<_> = values.iter().map(|v| v.value).collect();
        assert_eq!(
            magnitudes,
            vec![
                Magnitude::Scaled(1315.72),
                Magnitude::Raw(230),
                Magnitude::Scaled(5.2),
            ]
        );
    }

    #[tokio::test]
    async fn failed_read_skips_only_that_parameter() {
        let mut reader = ScriptedReader::new([
            Err(io::Error::new(io::ErrorKind::Other, "Modbus exception")),
            Ok(vec![230]),
            Ok(vec![52]),
        ]);

        let values = read_parameters(&mut reader, &table(), 1).await.unwrap();

        assert_eq!(reader.requests.len(), 3);
        let names: Vec<_> = values.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["voltage", "current"]);
    }

    #[tokio::test]
    async fn all_reads_failing_yields_no_values() {
        let mut reader = ScriptedReader::default();
        let values = read_parameters(&mut reader, &table(), 1).await.unwrap();

        assert!(values.is_empty());
        assert_eq!(reader.requests.len(), 3);
    }

    #[tokio::test]
    async fn short_response_aborts_the_pass() {
        let mut reader = ScriptedReader::new([Ok(vec![500]), Ok(vec![230]), Ok(vec![52])]);

        let result = read_parameters(&mut reader, &table(), 1).await;

        assert!(matches!(
            result,
            Err(Error::UnexpectedResponse { ref name, expected: 2, got: 1 }) if name == "energy_total"
        ));
        assert_eq!(reader.requests.len(), 1);
    }

    #[tokio::test]
    async fn scan_stops_after_max_errors() {
        let mut reader = ScriptedReader::new([
            Ok(vec![11]),
            Err(io::Error::new(io::ErrorKind::Other, "illegal address")),
            Ok(vec![13]),
        ]);
        let mut seen = vec![];

        // The script runs dry after three reads, every later read times out.
        let answered = scan_registers(&mut reader, 2, 0x10, 3, |address, word| {
            seen.push((address, word))
        })
        .await;

        assert_eq!(answered, 2);
        assert_eq!(seen, vec![(0x10, 11), (0x12, 13)]);
        assert_eq!(reader.requests.len(), 5);
        assert_eq!(reader.requests.last(), Some(&(2, 0x14, 1)));
    }

    #[tokio::test]
    async fn scan_ends_at_the_last_address() {
        let mut reader = ScriptedReader::new([Ok(vec![1]), Ok(vec![2])]);

        let answered = scan_registers(&mut reader, 1, u16::MAX - 1, 5, |_, _| {}).await;

        assert_eq!(answered, 2);
        assert_eq!(reader.requests.len(), 2);
    }
}
