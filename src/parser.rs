use nom::{
    bits::{bits, complete::take as take_bits},
    bytes::complete::take,
    multi::count,
    number::complete::{be_i32, be_u16, be_u8},
    sequence::tuple,
    IResult,
};

use crate::dns::{
    DomainName, Error, Header, Message, QueryType, Question, RData, ResourceRecord,
};

type BitInput<'a> = (&'a [u8], usize);

/// Upper two bits of a length octet that mark a compression pointer.
const POINTER_TAG: u8 = 0b1100_0000;

/// Hard limit on chained compression pointers within one name.
const MAX_POINTER_HOPS: usize = 16;

fn take_one_bit(input: BitInput) -> IResult<BitInput, u8, Error> {
    take_bits(1usize)(input)
}

fn take_three_bits(input: BitInput) -> IResult<BitInput, u8, Error> {
    take_bits(3usize)(input)
}

fn take_four_bits(input: BitInput) -> IResult<BitInput, u8, Error> {
    take_bits(4usize)(input)
}

pub fn header(input: &[u8]) -> IResult<&[u8], Header, Error> {
    let mut parser = tuple((
        be_u16,
        bits(tuple((
            take_one_bit,
            take_four_bits,
            take_one_bit,
            take_one_bit,
            take_one_bit,
            take_one_bit,
            take_three_bits,
            take_four_bits,
        ))),
        be_u16,
        be_u16,
        be_u16,
        be_u16,
    ));

    let parsed: IResult<_, _, Error> = parser(input);
    let (input, (id, (qr, opcode, aa, tc, rd, ra, _z, rcode), qd_count, an_count, ns_count, ar_count)) =
        parsed?;

    Ok((
        input,
        Header {
            id,
            qr: qr.into(),
            opcode: opcode.into(),
            authoritative_answer: aa != 0,
            truncated: tc != 0,
            recursion_desired: rd != 0,
            recursion_available: ra != 0,
            response_code: rcode.into(),
            qd_count,
            an_count,
            ns_count,
            ar_count,
        },
    ))
}

/// Position of `input` within `packet`; `input` must be a suffix of `packet`.
fn offset_in(packet: &[u8], input: &[u8]) -> usize {
    packet.len() - input.len()
}

fn label(input: &[u8], len: u8) -> IResult<&[u8], Vec<u8>, Error> {
    let (rem, raw) = take::<_, _, Error>(len)(input)?;

    Ok((rem, raw.to_vec()))
}

/// Implemented as described in [RFC 1035](https://tools.ietf.org/html/rfc1035#section-4.1.4)
///
/// `packet` is the complete message and is used to resolve compression
/// pointers. Each pointer must refer to a position strictly before the
/// previous one, so a pointer that targets itself or anything after it is
/// rejected with `MalformedName`. After a pointer the returned input resumes
/// right behind the two pointer octets.
pub fn domain_name<'a>(
    packet: &'a [u8],
) -> impl FnMut(&'a [u8]) -> IResult<&'a [u8], DomainName, Error> {
    move |input: &'a [u8]| {
        let mut labels = Vec::new();
        let mut cursor = input;
        let mut resume = None;
        let mut last_target: Option<usize> = None;
        let mut hops = 0;

        loop {
            let here = offset_in(packet, cursor);
            let (rem, len) = be_u8::<_, Error>(cursor)?;

            if len == 0 {
                cursor = rem;
                break;
            }

            match len & POINTER_TAG {
                0 => {
                    let (rem, label) = label(rem, len)?;
                    labels.push(label);
                    cursor = rem;
                }
                POINTER_TAG => {
                    let (rem, low) = be_u8::<_, Error>(rem)?;
                    let target = usize::from(len & !POINTER_TAG) << 8 | usize::from(low);

                    let limit = last_target.map_or(here, |last| last.min(here));
                    if target >= limit || hops == MAX_POINTER_HOPS {
                        return Err(nom::Err::Failure(Error::MalformedName));
                    }

                    hops += 1;
                    last_target = Some(target);
                    resume.get_or_insert(rem);
                    cursor = &packet[target..];
                }
                // 0b01 and 0b10 prefixes are reserved
                _ => return Err(nom::Err::Failure(Error::MalformedName)),
            }
        }

        let name = DomainName::from_labels(labels).map_err(nom::Err::Failure)?;

        Ok((resume.unwrap_or(cursor), name))
    }
}

pub fn question<'a>(packet: &'a [u8]) -> impl FnMut(&'a [u8]) -> IResult<&'a [u8], Question, Error> {
    move |input: &'a [u8]| {
        let (rem, (name, qtype, qclass)) = tuple((domain_name(packet), be_u16, be_u16))(input)?;

        Ok((
            rem,
            Question {
                name,
                query_type: qtype.into(),
                query_class: qclass.into(),
            },
        ))
    }
}

pub fn resource_record<'a>(
    packet: &'a [u8],
) -> impl FnMut(&'a [u8]) -> IResult<&'a [u8], ResourceRecord, Error> {
    move |input: &'a [u8]| {
        let (rem, (name, rtype, class, ttl, rdlength)) =
            tuple((domain_name(packet), be_u16, be_u16, be_i32, be_u16))(input)?;
        let (rem, raw) = take::<_, _, Error>(rdlength)(rem)?;

        let record_type = QueryType::from(rtype);
        let data = match (record_type, raw) {
            (QueryType::A, &[a, b, c, d]) => RData::A([a, b, c, d].into()),
            _ => RData::Opaque(raw.to_vec()),
        };

        Ok((
            rem,
            ResourceRecord {
                name,
                record_type,
                class: class.into(),
                ttl,
                data,
            },
        ))
    }
}

/// Decodes a complete DNS message.
///
/// Exactly `qd_count` questions and `an_count` answers are read; running
/// out of bytes before that is a `TruncatedPacket`. Trailing authority and
/// additional records are ignored.
pub fn message(packet: &[u8]) -> Result<Message, Error> {
    match sections(packet) {
        Ok((_, message)) => Ok(message),
        Err(nom::Err::Incomplete(_)) => Err(Error::TruncatedPacket),
        Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => Err(e),
    }
}

fn sections(packet: &[u8]) -> IResult<&[u8], Message, Error> {
    let (input, header) = header(packet)?;
    let (input, questions) = count(question(packet), header.qd_count.into())(input)?;
    let (input, answers) = count(resource_record(packet), header.an_count.into())(input)?;

    Ok((
        input,
        Message {
            header,
            questions,
            answers,
        },
    ))
}
